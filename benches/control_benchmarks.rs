//! Control-message parsing and descriptor rewriting benchmarks.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use plugin_pipeline::control::ControlMessage;
use plugin_pipeline::xml;

const SIMPLE: &str = "<plugin><name>echo1</name><action>new</action>\
    <type>pipeline.plugin.Echo</type><version>1</version><work/>\
    <destinations><input>in</input><output>out</output></destinations></plugin>";

const TEMPLATE: &str = r#"<plugin>
  <name>shape1</name>
  <action>update</action>
  <type>pipeline.plugin.XmlTransform</type>
  <version>1</version>
  <work><order id="{{/trade/id}}"><ccy>{{ /trade/currency }}</ccy></order></work>
  <destinations>
    <input>trades</input>
    <output>orders</output>
    <replyto>errors</replyto>
  </destinations>
</plugin>"#;

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("ControlMessage");

    group.bench_function("parse_simple", |b| {
        b.iter(|| ControlMessage::parse(black_box(SIMPLE), true))
    });

    group.bench_function("parse_template_work", |b| {
        b.iter(|| ControlMessage::parse(black_box(TEMPLATE), true))
    });

    group.bench_function("parse_unvalidated", |b| {
        b.iter(|| ControlMessage::parse(black_box(TEMPLATE), false))
    });

    group.finish();
}

fn bench_persist(c: &mut Criterion) {
    let message = ControlMessage::parse(TEMPLATE, true).unwrap();

    c.bench_function("to_persisted_xml", |b| {
        b.iter(|| black_box(&message).to_persisted_xml())
    });

    c.bench_function("replace_text", |b| {
        b.iter(|| xml::replace_text(black_box(TEMPLATE), "/plugin/action", "new"))
    });
}

criterion_group!(benches, bench_parse, bench_persist);
criterion_main!(benches);
