//! End-to-end behaviour of composed pipelines.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rpcguard_core::policy::{
    Bulkhead, BulkheadConfig, CircuitBreakerConfig, RetryConfig, TimeoutConfig,
};
use rpcguard_core::{
    compose, handler_fn, interceptor_fn, CallEnvelope, CallError, Code, GuardConfig, Handler,
    Interceptor, MethodRouter, Pipeline, SharedInterceptor,
};
use serde_json::{json, Value};

fn tracking(tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> SharedInterceptor {
    interceptor_fn(tag, move |next: Handler| {
        let log = log.clone();
        handler_fn(move |call: CallEnvelope| {
            let next = next.clone();
            let log = log.clone();
            async move {
                log.lock().unwrap().push(tag);
                next.call(call).await
            }
        })
    })
}

#[tokio::test]
async fn bulkhead_two_slots_three_callers() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let terminal = {
        let current = current.clone();
        let peak = peak.clone();
        handler_fn(move |_call: CallEnvelope| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!("ok"))
            }
        })
    };

    let bulkhead = Bulkhead::new(BulkheadConfig {
        capacity: 2,
        queue_capacity: 0,
        bypass_streaming: true,
    })
    .unwrap();
    let handler = bulkhead.intercept(terminal);

    let calls = (0..3).map(|i| {
        let handler = handler.clone();
        tokio::spawn(async move { handler.call(CallEnvelope::new("svc", "Sleep", json!(i))).await })
    });
    let results: Vec<_> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let exhausted: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(ok, 2);
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].code(), Code::ResourceExhausted);
    assert!(exhausted[0].is_rejection());
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn router_fans_out_global_service_exact() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let router = MethodRouter::new(vec![
        ("*", vec![tracking("global", log.clone())]),
        ("Svc/*", vec![tracking("service", log.clone())]),
        ("Svc/Method", vec![tracking("exact", log.clone())]),
    ])
    .unwrap();
    let handler = compose(
        &[Arc::new(router) as SharedInterceptor],
        handler_fn(|call: CallEnvelope| async move { Ok(call.payload) }),
    );

    let out = handler
        .call(CallEnvelope::new("Svc", "Method", json!(42)))
        .await
        .unwrap();
    assert_eq!(out, json!(42));
    assert_eq!(*log.lock().unwrap(), vec!["global", "service", "exact"]);
}

#[tokio::test(start_paused = true)]
async fn full_stack_recovers_transient_failures() {
    let hits = Arc::new(AtomicU32::new(0));
    let terminal = {
        let hits = hits.clone();
        handler_fn(move |call: CallEnvelope| {
            let hits = hits.clone();
            async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(CallError::unavailable("warming up"));
                }
                Ok(call.payload)
            }
        })
    };

    let handler = Pipeline::builder()
        .normalize_errors()
        .timeout(TimeoutConfig {
            duration: Duration::from_secs(1),
            bypass_streaming: true,
        })
        .bulkhead(BulkheadConfig {
            capacity: 4,
            queue_capacity: 4,
            bypass_streaming: true,
        })
        .circuit_breaker(CircuitBreakerConfig::default())
        .retry(RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..Default::default()
        })
        .into_handler(terminal)
        .unwrap();

    let out = handler
        .call(CallEnvelope::new("svc", "m", json!("payload")))
        .await
        .unwrap();
    assert_eq!(out, json!("payload"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_bounds_retries_beneath_it() {
    let handler = Pipeline::builder()
        .timeout(TimeoutConfig {
            duration: Duration::from_millis(100),
            bypass_streaming: true,
        })
        .retry(RetryConfig {
            max_retries: 50,
            initial_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(40),
            ..Default::default()
        })
        .into_handler(handler_fn(|_call: CallEnvelope| async move {
            Err(CallError::unavailable("down"))
        }))
        .unwrap();

    let err = handler
        .call(CallEnvelope::new("svc", "m", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::DeadlineExceeded { ms: 100 });
}

#[tokio::test(start_paused = true)]
async fn timed_out_calls_count_toward_the_breaker() {
    let invocations = Arc::new(AtomicU32::new(0));
    let saw_cancel = Arc::new(AtomicU32::new(0));
    let terminal = {
        let invocations = invocations.clone();
        let saw_cancel = saw_cancel.clone();
        handler_fn(move |call: CallEnvelope| {
            let invocations = invocations.clone();
            let saw_cancel = saw_cancel.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                call.cancel.cancelled().await;
                saw_cancel.fetch_add(1, Ordering::SeqCst);
                Err(CallError::status(Code::Cancelled, "upstream hung"))
            }
        })
    };

    let handler = Pipeline::builder()
        .timeout(TimeoutConfig {
            duration: Duration::from_millis(10),
            bypass_streaming: true,
        })
        .circuit_breaker(CircuitBreakerConfig {
            threshold: 2,
            half_open_after: Duration::from_secs(60),
            bypass_streaming: true,
        })
        .into_handler(terminal)
        .unwrap();

    let mut errors = Vec::new();
    for _ in 0..5 {
        let err = handler
            .call(CallEnvelope::new("svc", "Hang", Value::Null))
            .await
            .unwrap_err();
        errors.push(err);
        // Let the signalled call finish and report to the breaker.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(errors[0], CallError::DeadlineExceeded { ms: 10 });
    assert_eq!(errors[1], CallError::DeadlineExceeded { ms: 10 });
    for err in &errors[2..] {
        assert_eq!(*err, CallError::CircuitOpen { threshold: 2 });
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(saw_cancel.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn configured_routes_apply_per_pattern() {
    let config = GuardConfig::from_json_str(
        r#"{
            "routes": {
                "*": { "normalize_errors": true },
                "inventory.Stock/Reserve": {
                    "fallback": { "value": { "reserved": false }, "codes": ["internal"] }
                }
            }
        }"#,
    )
    .unwrap();
    let router = config.build_router().unwrap();
    let handler = router.intercept(handler_fn(|call: CallEnvelope| async move {
        match call.method.as_str() {
            "Reserve" => Err(CallError::internal("ledger write failed")),
            "Audit" => panic!("audit log unavailable"),
            _ => Err(CallError::status(Code::NotFound, "unknown sku")),
        }
    }));

    // The exact-route fallback recovers the internal failure.
    let out = handler
        .call(CallEnvelope::new("inventory.Stock", "Reserve", Value::Null))
        .await
        .unwrap();
    assert_eq!(out, json!({ "reserved": false }));

    // The global stage turns a panic into an internal failure.
    let err = handler
        .call(CallEnvelope::new("inventory.Stock", "Audit", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    // Other methods only get the global stage and see their own failure.
    let err = handler
        .call(CallEnvelope::new("inventory.Stock", "Lookup", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::status(Code::NotFound, "unknown sku"));
}
