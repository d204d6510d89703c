use async_trait::async_trait;
use criterion::{Criterion, criterion_group, criterion_main};
use http::Method;
use routeline::config::MappingConfig;
use routeline::exchange::Exchange;
use routeline::handler::{Controller, HandlerError, HandlerMethod, HandlerOutput, MethodRef};
use routeline::router::info::RequestMappingInfo;
use routeline::router::strategy::{RequestMappingHandlerMapping, RequestMappingStrategy};
use std::hint::black_box;
use std::sync::Arc;

// Compares lookups served by the direct-path index with lookups that fall back
// to scanning every registered mapping.

struct BenchController;

#[async_trait]
impl Controller for BenchController {
    fn type_name(&self) -> &str {
        "BenchController"
    }

    fn methods(&self) -> Vec<MethodRef> {
        Vec::new()
    }

    async fn invoke(&self, _method: &MethodRef, _exchange: &mut Exchange) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::Empty)
    }
}

fn populated_mapping(num_routes: usize) -> RequestMappingHandlerMapping {
    let mapping = RequestMappingStrategy::handler_mapping(MappingConfig::default());
    let controller: Arc<dyn Controller> = Arc::new(BenchController);
    for i in 0..num_routes {
        let literal = RequestMappingInfo::paths(&[format!("/api/static{}", i)])
            .get()
            .build()
            .unwrap();
        mapping
            .register_mapping(literal, HandlerMethod::new(controller.clone(), MethodRef::new(format!("static{}", i))))
            .unwrap();

        let pattern = RequestMappingInfo::paths(&[format!("/api/dynamic{}/{{id}}", i)])
            .get()
            .build()
            .unwrap();
        mapping
            .register_mapping(pattern, HandlerMethod::new(controller.clone(), MethodRef::new(format!("dynamic{}", i))))
            .unwrap();
    }
    mapping
}

fn exchange(uri: &str) -> Exchange {
    Exchange::builder().method(Method::GET).uri(uri).build().unwrap()
}

fn bench_direct_path_lookup(c: &mut Criterion) {
    let mapping = populated_mapping(500);

    c.bench_function("direct_path_lookup", |b| {
        b.iter(|| {
            let mut exchange = exchange("/api/static250");
            black_box(mapping.lookup_handler_method(&mut exchange).unwrap());
        });
    });
}

fn bench_pattern_scan_lookup(c: &mut Criterion) {
    let mapping = populated_mapping(500);

    c.bench_function("pattern_scan_lookup", |b| {
        b.iter(|| {
            let mut exchange = exchange("/api/dynamic250/12345");
            black_box(mapping.lookup_handler_method(&mut exchange).unwrap());
        });
    });
}

fn bench_lookup_miss(c: &mut Criterion) {
    let mapping = populated_mapping(500);

    c.bench_function("lookup_miss", |b| {
        b.iter(|| {
            let mut exchange = exchange("/nowhere/at/all");
            black_box(mapping.lookup_handler_method(&mut exchange).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_direct_path_lookup,
    bench_pattern_scan_lookup,
    bench_lookup_miss
);
criterion_main!(benches);
