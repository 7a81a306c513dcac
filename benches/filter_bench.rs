use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::hint::black_box;

use crm_filter::sql_compiler::SqlCompiler;
use crm_filter::{Filter, ValueDictionary};

// 基准用的过滤器定义
fn test_cases() -> Vec<(&'static str, Value)> {
    vec![
        ("simple", json!([["KD", -1, "", ["LEAF", 2, "=", null, ["$parStatus"]]]])),
        (
            "medium",
            json!([[
                "KD", -1, "",
                ["AND",
                    ["LEAF", 2, "=", null, ["$parStatus"]],
                    ["OR", ["LEAF", 3, ">", null, ["$compareNumber", "10"]], ["LEAF", 4, "<>", null, ["X"]]]
                ],
                [["KP", 0, "HAVING", ["LEAF", 7, "=", null, ["$parStatus", "NEW"]]]]
            ]]),
        ),
        (
            "complex",
            json!([[
                "FI", -1, "",
                ["AND",
                    ["LEAF", 2, "=", null, ["$parStatus"]],
                    ["LEAF", 9, "=", "Compare", ["$curRep", "$curRep"]],
                    ["LEAF", -1, "", "Error", ["error.status"]]
                ],
                [
                    ["KP", 0, "HAVING", ["LEAF", 3, "=", null, ["$parValue"]]],
                    ["KP", 2, "HAVINGOPTIONAL", ["LEAF", 4, "=", null, ["$parCountry"]]],
                    ["MA", -1, "WITHOUT", ["LEAF", 1, "=", "RemoveInfoAreaIfEmpty", ["$parPerson"]]]
                ]
            ]]),
        ),
    ]
}

fn dictionary() -> ValueDictionary {
    ValueDictionary::new()
        .with("parStatus", ["ACTIVE"])
        .with("parCountry", ["AT", "DE"])
        .with("parValue", ["1"])
        .with("parPerson", [""])
        .with("curRep", ["7"])
}

// 基准测试：定义转换性能
fn benchmark_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("conversion_performance");
    for (name, definition) in test_cases() {
        group.bench_with_input(BenchmarkId::new("from_definition", name), &definition, |b, definition| {
            b.iter(|| black_box(Filter::from_definition("bench", black_box(definition)).unwrap()))
        });
    }
    group.finish();
}

// 基准测试：校验性能
fn benchmark_check(c: &mut Criterion) {
    let dictionary = dictionary();
    let mut group = c.benchmark_group("check_performance");
    for (name, definition) in test_cases() {
        let filter = Filter::from_definition("bench", &definition)
            .unwrap()
            .apply_value_dictionary(&dictionary)
            .unwrap();
        group.bench_with_input(BenchmarkId::new("check_value", name), &filter, |b, filter| {
            b.iter(|| black_box(filter.check_value(black_box("INACTIVE"))))
        });
    }
    group.finish();
}

// 基准测试：参数替换与合并性能
fn benchmark_rewrite(c: &mut Criterion) {
    let dictionary = dictionary();
    let mut group = c.benchmark_group("rewrite_performance");
    for (name, definition) in test_cases() {
        let filter = Filter::from_definition("bench", &definition).unwrap();
        group.bench_with_input(BenchmarkId::new("apply_replacements", name), &filter, |b, filter| {
            b.iter(|| black_box(filter.apply_value_dictionary(black_box(&dictionary))))
        });
        group.bench_with_input(BenchmarkId::new("append_or_filter", name), &filter, |b, filter| {
            b.iter(|| black_box(filter.append_or_filter(black_box(filter))))
        });
    }
    group.finish();
}

// 基准测试：SQL编译性能
fn benchmark_sql_compiler(c: &mut Criterion) {
    let compiler = SqlCompiler::new();
    let dictionary = dictionary();
    let mut group = c.benchmark_group("sql_compiler_performance");
    for (name, definition) in test_cases() {
        let filter = Filter::from_definition("bench", &definition)
            .unwrap()
            .apply_value_dictionary(&dictionary)
            .unwrap();
        group.bench_with_input(BenchmarkId::new("compile", name), &filter, |b, filter| {
            b.iter(|| black_box(compiler.compile(black_box(filter)).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_conversion,
    benchmark_check,
    benchmark_rewrite,
    benchmark_sql_compiler
);
criterion_main!(benches);
