use crate::bus::BusMessage;
use crate::error::PluginError;
use crate::plugin::{MessageContext, Plugin, PluginSpec};
use crate::xml;
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Reject anything that is not a read-only query.
fn check_query(sql: &str) -> Result<(), PluginError> {
    let trimmed = sql.trim_start();
    let verb = trimmed.get(..6).unwrap_or_default();
    let follows = trimmed[verb.len()..].chars().next();
    if verb.eq_ignore_ascii_case("select") && follows.is_some_and(char::is_whitespace) {
        Ok(())
    } else {
        Err(PluginError::UnsafeQuery {
            sql: sql.to_string(),
        })
    }
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s,
        Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
    }
}

/// A single-parameter lookup query against a shared connection.
#[derive(Clone)]
pub struct ValueLookup {
    db: Arc<Mutex<Connection>>,
    sql: String,
}

impl ValueLookup {
    pub fn new(db: Arc<Mutex<Connection>>, sql: impl Into<String>) -> Result<Self, PluginError> {
        let sql = sql.into();
        check_query(&sql)?;
        Ok(Self { db, sql })
    }

    /// First column of the first row matching `key`.
    pub async fn get_value(&self, key: &str) -> Result<String, PluginError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&self.sql)?;
        let value = stmt.query_row([key], |row| row.get::<_, Value>(0))?;
        Ok(value_to_string(value))
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// One enrichment step: read `src_path`, look it up, write the result to `dst_path`.
#[derive(Clone)]
pub struct EnrichmentRule {
    pub src_path: String,
    pub dst_path: String,
    pub lookup: ValueLookup,
}

impl EnrichmentRule {
    async fn apply(&self, document: &str) -> Result<String, PluginError> {
        let key = {
            let doc = xml::parse(document)?;
            xml::select_text(&doc, &self.src_path)?
        };
        let value = self.lookup.get_value(&key).await?;
        Ok(xml::replace_text(document, &self.dst_path, &value)?)
    }
}

impl std::fmt::Display for EnrichmentRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "srcPath={},dstPath={},sql={}",
            self.src_path,
            self.dst_path,
            self.lookup.sql()
        )
    }
}

/// Rewrites fields of the input document with values looked up in SQLite.
pub struct XmlValueTransform {
    name: String,
    rules: Vec<EnrichmentRule>,
}

impl XmlValueTransform {
    pub const TYPE_NAME: &'static str = "pipeline.plugin.XmlValueTransform";

    pub fn create(spec: &PluginSpec) -> Result<Box<dyn Plugin>, PluginError> {
        Ok(Box::new(Self::from_work(&spec.name, &spec.work)?))
    }

    /// Build from an `<enrich>` document naming the database and the rules.
    pub fn from_work(name: &str, work: &str) -> Result<Self, PluginError> {
        let configuration = |reason: String| PluginError::Configuration { reason };

        let doc = xml::parse(work).map_err(|e| configuration(e.to_string()))?;
        let root = doc.root_element();
        if root.tag_name().name() != "enrich" {
            return Err(configuration(format!(
                "expected <enrich>, found <{}>",
                root.tag_name().name()
            )));
        }

        let database = xml::child(root, "database")
            .map(xml::text_of)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| configuration("missing <database>".to_string()))?;
        // Lookups never write; a wrong path must not leave an empty database behind.
        let connection = Connection::open_with_flags(&database, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| configuration(format!("cannot open database '{database}': {e}")))?;

        let elements = xml::child(root, "elements")
            .ok_or_else(|| configuration("missing <elements>".to_string()))?;
        let mut configured = Vec::new();
        for element in elements
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "element")
        {
            let field = |tag: &str| {
                xml::child(element, tag)
                    .map(xml::text_of)
                    .map(|t| t.trim().to_string())
                    .unwrap_or_default()
            };
            let src_path = field("srcPath");
            if src_path.is_empty() {
                return Err(configuration("element without <srcPath>".to_string()));
            }
            xml::segments(&src_path).map_err(|e| configuration(e.to_string()))?;
            let dst_path = match field("dstPath") {
                dst if dst.is_empty() => src_path.clone(),
                dst => dst,
            };
            xml::segments(&dst_path).map_err(|e| configuration(e.to_string()))?;

            let sql = field("sql");
            check_query(&sql)?;
            let parameters = connection
                .prepare(&sql)
                .map_err(|e| configuration(format!("query '{sql}' is invalid: {e}")))?
                .parameter_count();
            if parameters != 1 {
                return Err(configuration(format!(
                    "query '{sql}' takes {parameters} parameters, expected 1"
                )));
            }
            configured.push((src_path, dst_path, sql));
        }

        let db = Arc::new(Mutex::new(connection));
        let mut rules = Vec::with_capacity(configured.len());
        for (src_path, dst_path, sql) in configured {
            rules.push(EnrichmentRule {
                src_path,
                dst_path,
                lookup: ValueLookup::new(db.clone(), sql)?,
            });
        }

        Self::with_rules(name, rules)
    }

    pub fn with_rules(name: &str, rules: Vec<EnrichmentRule>) -> Result<Self, PluginError> {
        if rules.is_empty() {
            return Err(PluginError::Configuration {
                reason: "no enrichment elements configured".to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            rules,
        })
    }

    pub async fn transform(&self, document: &str) -> String {
        let mut current = document.to_string();
        for rule in &self.rules {
            match rule.apply(&current).await {
                Ok(updated) => current = updated,
                Err(e) => {
                    tracing::warn!(plugin = %self.name, rule = %rule, error = %e, "Enrichment skipped");
                }
            }
        }
        current
    }
}

#[async_trait]
impl Plugin for XmlValueTransform {
    async fn on_message(
        &self,
        message: &BusMessage,
        _context: &MessageContext,
    ) -> Result<Option<String>, PluginError> {
        xml::parse(&message.payload)?;
        Ok(Some(self.transform(&message.payload).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SQL_SELECT: &str = "select name from currency where alias = ?";

    fn currency_db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table currency (id INT, name VARCHAR(3), alias VARCHAR(3));
             insert into currency values (1, 'USD', 'XXX');",
        )
        .unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[tokio::test]
    async fn test_get_value() {
        let lookup = ValueLookup::new(currency_db(), SQL_SELECT).unwrap();
        assert_eq!(lookup.get_value("XXX").await.unwrap(), "USD");
        assert!(matches!(
            lookup.get_value("nope").await,
            Err(PluginError::Database(_))
        ));
    }

    #[test]
    fn test_unsafe_query_is_rejected() {
        for sql in ["drop table currency", "", "selectname from x", "update x set a = 1"] {
            let err = ValueLookup::new(currency_db(), sql).err().unwrap();
            assert!(matches!(err, PluginError::UnsafeQuery { .. }), "{sql}");
            assert!(err.is_configuration());
        }
        assert!(ValueLookup::new(currency_db(), "SELECT\tname from currency where alias = ?").is_ok());
    }

    #[tokio::test]
    async fn test_transform_rewrites_in_place_and_skips_failures() {
        let db = currency_db();
        let transform = XmlValueTransform::with_rules(
            "enrich1",
            vec![
                EnrichmentRule {
                    src_path: "/trade/ccy".into(),
                    dst_path: "/trade/ccy".into(),
                    lookup: ValueLookup::new(db.clone(), SQL_SELECT).unwrap(),
                },
                EnrichmentRule {
                    src_path: "/trade/missing".into(),
                    dst_path: "/trade/missing".into(),
                    lookup: ValueLookup::new(db, SQL_SELECT).unwrap(),
                },
            ],
        )
        .unwrap();

        let output = transform
            .transform("<trade>\n  <ccy>XXX</ccy>\n</trade>")
            .await;
        assert_eq!(output, "<trade>\n  <ccy>USD</ccy>\n</trade>");
    }

    #[test]
    fn test_from_work_reads_database_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lookup.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "create table currency (name TEXT, alias TEXT);
                 insert into currency values ('USD', 'XXX');",
            )
            .unwrap();
        }

        let work = format!(
            "<enrich><database>{}</database><elements><element>\
             <srcPath>/trade/ccy</srcPath><dstPath>/trade/name</dstPath>\
             <sql>{SQL_SELECT}</sql></element></elements></enrich>",
            path.display()
        );
        let transform = XmlValueTransform::from_work("enrich1", &work).unwrap();
        assert_eq!(transform.rules.len(), 1);
        assert_eq!(transform.rules[0].dst_path, "/trade/name");

        let unsafe_work = work.replace(SQL_SELECT, "drop table currency");
        assert!(matches!(
            XmlValueTransform::from_work("enrich1", &unsafe_work),
            Err(PluginError::UnsafeQuery { .. })
        ));
    }

    fn currency_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("lookup.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "create table currency (name TEXT, alias TEXT);
             insert into currency values ('USD', 'XXX');",
        )
        .unwrap();
        path
    }

    fn enrich_work(database: &std::path::Path, sql: &str) -> String {
        format!(
            "<enrich><database>{}</database><elements><element>\
             <srcPath>/trade/ccy</srcPath><sql>{sql}</sql></element></elements></enrich>",
            database.display()
        )
    }

    #[test]
    fn test_empty_elements_rejected() {
        let dir = TempDir::new().unwrap();
        let work = format!(
            "<enrich><database>{}</database><elements/></enrich>",
            currency_file(&dir).display()
        );
        assert!(matches!(
            XmlValueTransform::from_work("enrich1", &work),
            Err(PluginError::Configuration { .. })
        ));
    }

    #[test]
    fn test_missing_database_is_not_created() {
        let dir = TempDir::new().unwrap();
        let typo = dir.path().join("typo.db");

        let err = XmlValueTransform::from_work("enrich1", &enrich_work(&typo, SQL_SELECT))
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Configuration { .. }));
        assert!(err.is_configuration());
        assert!(!typo.exists());
    }

    #[test]
    fn test_queries_are_checked_against_the_schema() {
        let dir = TempDir::new().unwrap();
        let path = currency_file(&dir);

        for sql in [
            "select name from no_such_table where alias = ?",
            "select name from currency",
            "select name from currency where alias = ? and name = ?",
        ] {
            let err = XmlValueTransform::from_work("enrich1", &enrich_work(&path, sql))
                .err()
                .unwrap();
            assert!(matches!(err, PluginError::Configuration { .. }), "{sql}");
        }
        assert!(XmlValueTransform::from_work("enrich1", &enrich_work(&path, SQL_SELECT)).is_ok());
    }
}
