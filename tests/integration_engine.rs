mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{MockScript, ScriptedReply};
use pledge::{middleware_fn, reject_error_statuses, Client, Error, ErrorKind, Options, Resolution};
use serde_json::json;

fn client_with(script: &MockScript, options: Options) -> Client {
    Client::with_driver(script.factory(), options)
}

#[test]
fn single_get_success_settles_with_response_and_counts() {
    let script = MockScript::new();
    script.route("/ok", vec![ScriptedReply::ok("hi")]);
    let client = client_with(&script, Options::default());

    let promise = client.get("http://t/ok").send();
    let response = promise
        .wait(Some(Duration::from_secs(2)))
        .expect("request should fulfill");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text_lossy(), "hi");
    assert_eq!(response.url(), "http://t/ok");

    let metrics = client.metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.failed_requests, 0);
}

#[test]
fn retry_on_503_backs_off_exponentially_and_fulfills() {
    let script = MockScript::new();
    script.route(
        "/r",
        vec![
            ScriptedReply::status(503),
            ScriptedReply::status(503),
            ScriptedReply::ok("done"),
        ],
    );
    let client =
        client_with(&script, Options::default()).with_retry(2, Duration::from_millis(10), [503]);

    let response = client
        .get("http://t/r")
        .send()
        .wait(Some(Duration::from_secs(5)))
        .expect("final attempt should fulfill");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text_lossy(), "done");

    let attempts = script.attempts();
    assert_eq!(attempts.len(), 3, "driver should observe three attempts");
    let first_gap = attempts[1].at - attempts[0].at;
    let second_gap = attempts[2].at - attempts[1].at;
    assert!(
        first_gap >= Duration::from_millis(10),
        "first retry gap was {first_gap:?}"
    );
    assert!(
        second_gap >= Duration::from_millis(20),
        "second retry gap was {second_gap:?}"
    );

    let metrics = client.metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.retries, 2);
}

#[test]
fn post_is_never_retried_and_error_status_fulfills() {
    let script = MockScript::new();
    script.route("/p", vec![ScriptedReply::status(500)]);
    let client =
        client_with(&script, Options::default()).with_retry(3, Duration::from_millis(10), [500]);

    let response = client
        .post("http://t/p")
        .body(json!({"x": 1}))
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("status errors fulfill unless a middleware opts in");

    assert_eq!(response.status().as_u16(), 500);
    assert_eq!(script.attempt_count("/p"), 1);
}

#[test]
fn transport_error_retries_then_rejects_when_budget_is_spent() {
    let script = MockScript::new();
    script.route(
        "/t",
        vec![ScriptedReply::transport_error("connection refused")],
    );
    let client =
        client_with(&script, Options::default()).with_retry(1, Duration::from_millis(5), [503]);

    let error = client
        .get("http://t/t")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect_err("exhausted transport retries should reject");

    assert_eq!(error.kind(), ErrorKind::Transport);
    match &error {
        Error::Transport { url, message, .. } => {
            assert_eq!(url, "http://t/t");
            assert!(message.contains("connection refused"));
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(script.attempt_count("/t"), 2);

    let metrics = client.metrics();
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.retries, 1);
}

#[test]
fn concurrency_cap_queues_overflow_and_never_exceeds_limit() {
    let script = MockScript::new();
    script.route(
        "/slow",
        vec![ScriptedReply::ok("s").hold(Duration::from_millis(50))],
    );
    let client = client_with(&script, Options::default().with_max_concurrent(2));

    let promises: Vec<_> = (0..5)
        .map(|_| client.get("http://t/slow").send())
        .collect();

    assert_eq!(client.pending_count(), 2);
    assert_eq!(client.queued_count(), 3);
    assert!(client.has_pending());

    client.wait(Some(Duration::from_secs(5)));

    for promise in &promises {
        assert!(promise.is_fulfilled(), "all five requests should fulfill");
    }
    assert!(!client.has_pending());
    assert!(
        script.high_water() <= 2,
        "active set exceeded the cap: {}",
        script.high_water()
    );
    assert_eq!(script.attempt_count("/slow"), 5);
}

#[test]
fn middleware_runs_in_registration_order_and_unwinds_in_reverse() {
    let script = MockScript::new();
    script.route("/m", vec![ScriptedReply::ok("body")]);
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let log_m1 = Arc::clone(&log);
    let log_m2 = Arc::clone(&log);
    let client = client_with(&script, Options::default())
        .with_middleware(middleware_fn(move |request, next| {
            log_m1.lock().expect("lock log").push("m1-before".to_owned());
            let log_after = Arc::clone(&log_m1);
            next.run(request).then(move |response| {
                log_after.lock().expect("lock log").push("m1-after".to_owned());
                Ok(Resolution::Value(response))
            })
        }))
        .with_middleware(middleware_fn(move |request, next| {
            log_m2.lock().expect("lock log").push("m2-before".to_owned());
            let log_after = Arc::clone(&log_m2);
            next.run(request).then(move |response| {
                log_after.lock().expect("lock log").push("m2-after".to_owned());
                Ok(Resolution::Value(response))
            })
        }));

    client
        .get("http://t/m")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("request should fulfill");

    let recorded = log.lock().expect("lock log").clone();
    assert_eq!(
        recorded,
        vec![
            "m1-before".to_owned(),
            "m2-before".to_owned(),
            "m2-after".to_owned(),
            "m1-after".to_owned(),
        ]
    );
}

#[test]
fn middleware_can_rewrite_the_request_before_dispatch() {
    let script = MockScript::new();
    script.route("/rewritten", vec![ScriptedReply::ok("yes")]);
    let client = client_with(&script, Options::default()).with_middleware(middleware_fn(
        |mut request, next| {
            request.url = "http://t/rewritten".to_owned();
            request.headers.push(("X-Injected".to_owned(), json!("1")));
            next.run(request)
        },
    ));

    let response = client
        .get("http://t/original")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("request should fulfill");
    assert_eq!(response.text_lossy(), "yes");

    let attempts = script.attempts();
    assert_eq!(attempts[0].path, "/rewritten");
    assert!(attempts[0]
        .headers
        .iter()
        .any(|(name, value)| name == "x-injected" && value == "1"));
}

#[test]
fn reject_error_statuses_middleware_produces_http_errors() {
    let script = MockScript::new();
    script.route("/missing", vec![ScriptedReply::status_with_body(404, "nope")]);
    let client = client_with(&script, Options::default()).with_middleware(reject_error_statuses());

    let error = client
        .get("http://t/missing")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect_err("404 should reject behind the status middleware");

    assert_eq!(error.kind(), ErrorKind::Http);
    match error {
        Error::HttpStatus {
            status, response, ..
        } => {
            assert_eq!(status, 404);
            assert_eq!(response.text_lossy(), "nope");
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[test]
fn configuration_methods_return_new_clients_and_leave_the_original_alone() {
    let script = MockScript::new();
    let client = client_with(&script, Options::default());

    let configured = client
        .with_base_url("https://api.example.com")
        .with_max_concurrent(3)
        .with_bearer_token("secret");

    assert_eq!(client.options().base_url(), "");
    assert_eq!(client.options().max_concurrent(), 50);
    assert!(client.options().default_headers().is_empty());

    assert_eq!(configured.options().base_url(), "https://api.example.com");
    assert_eq!(configured.options().max_concurrent(), 3);
    assert_eq!(
        configured.options().default_headers(),
        &[("Authorization".to_owned(), "Bearer secret".to_owned())]
    );
}

#[test]
fn unknown_method_rejects_and_lowercase_is_normalized() {
    let script = MockScript::new();
    script.route("/m", vec![ScriptedReply::ok("ok")]);
    let client = client_with(&script, Options::default());

    let error = client
        .request("FOO", "http://t/m")
        .send()
        .wait(Some(Duration::from_secs(1)))
        .expect_err("unknown method should reject");
    assert_eq!(error.kind(), ErrorKind::InvalidInput);

    let response = client
        .request("get", "http://t/m")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("lowercase method should normalize");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(script.attempts()[0].method, "GET");
}

#[test]
fn base_url_and_query_compose_the_absolute_url() {
    let script = MockScript::new();
    script.route("/p", vec![ScriptedReply::ok("ok")]);
    let client = client_with(&script, Options::default()).with_base_url("http://t");

    client
        .get("/p")
        .query_pair("a", "1")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("request should fulfill");

    assert_eq!(script.attempts()[0].url, "http://t/p?a=1");
}

#[test]
fn default_headers_and_user_agent_reach_the_wire() {
    let script = MockScript::new();
    script.route("/h", vec![ScriptedReply::ok("ok")]);
    let client = client_with(&script, Options::default())
        .with_header("X-Env", "test")
        .as_json();

    client
        .get("http://t/h")
        .header("x-env", "override")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("request should fulfill");

    let headers = script.attempts()[0].headers.clone();
    let lookup = |name: &str| {
        headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    };
    assert_eq!(lookup("x-env").as_deref(), Some("override"));
    assert_eq!(lookup("content-type").as_deref(), Some("application/json"));
    assert!(lookup("user-agent")
        .expect("user agent should be present")
        .starts_with("pledge/"));
}

#[test]
fn json_bodies_serialize_per_the_content_type_preset() {
    let script = MockScript::new();
    script.route("/j", vec![ScriptedReply::ok("ok")]);
    let client = client_with(&script, Options::default());

    client
        .json("post", "http://t/j", json!({"a": 1, "b": "x"}))
        .wait(Some(Duration::from_secs(2)))
        .expect("request should fulfill");

    let attempt = &script.attempts()[0];
    let body: serde_json::Value =
        serde_json::from_str(attempt.body.as_deref().expect("body should be present"))
            .expect("body should be json");
    assert_eq!(body, json!({"a": 1, "b": "x"}));
}

#[test]
fn handles_are_pooled_per_host_and_closed_when_pooling_is_disabled() {
    let script = MockScript::new();
    script.route("/a", vec![ScriptedReply::ok("1")]);

    let pooled = client_with(&script, Options::default());
    pooled
        .get("http://t/a")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("first request should fulfill");
    pooled
        .get("http://t/a")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("second request should fulfill");
    assert_eq!(script.allocated(), 1, "second request should reuse the pooled handle");

    let unpooled_script = MockScript::new();
    unpooled_script.route("/a", vec![ScriptedReply::ok("1")]);
    let unpooled = Client::with_driver(
        unpooled_script.factory(),
        Options::default().with_max_pool_size(0),
    );
    unpooled
        .get("http://t/a")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("first request should fulfill");
    unpooled
        .get("http://t/a")
        .send()
        .wait(Some(Duration::from_secs(2)))
        .expect("second request should fulfill");
    assert_eq!(unpooled_script.allocated(), 2);
    assert_eq!(unpooled_script.closed_handles(), 2);
}

#[test]
fn concurrent_aggregates_by_key_and_race_settles_first() {
    let script = MockScript::new();
    script.route("/a", vec![ScriptedReply::ok("alpha")]);
    script.route("/b", vec![ScriptedReply::ok("beta")]);
    script.route(
        "/slow",
        vec![ScriptedReply::ok("slow").hold(Duration::from_millis(80))],
    );
    let client = client_with(&script, Options::default());

    let combined = client.concurrent(vec![
        ("a", client.get("http://t/a")),
        ("b", client.get("http://t/b")),
    ]);
    let responses = combined
        .wait(Some(Duration::from_secs(2)))
        .expect("both requests should fulfill");
    assert_eq!(responses.len(), 2);
    assert_eq!(responses["a"].text_lossy(), "alpha");
    assert_eq!(responses["b"].text_lossy(), "beta");

    let winner = client.race(vec![
        ("slow", client.get("http://t/slow")),
        ("fast", client.get("http://t/a")),
    ]);
    let first = winner
        .wait(Some(Duration::from_secs(2)))
        .expect("the fast request should win");
    assert_eq!(first.text_lossy(), "alpha");
}

#[test]
fn client_wait_timeout_returns_without_rejecting() {
    let script = MockScript::new();
    script.route(
        "/slow",
        vec![ScriptedReply::ok("s").hold(Duration::from_millis(100))],
    );
    let client = client_with(&script, Options::default());

    let promise = client.get("http://t/slow").send();
    client.wait(Some(Duration::from_millis(5)));

    assert!(promise.is_pending(), "timeout must not reject in-flight work");
    assert!(client.has_pending());

    client.wait(Some(Duration::from_secs(5)));
    assert!(promise.is_fulfilled());
}

#[test]
fn invalid_url_rejects_with_invalid_input() {
    let script = MockScript::new();
    let client = client_with(&script, Options::default());

    let error = client
        .get("http://exa mple.com/x")
        .send()
        .wait(Some(Duration::from_secs(1)))
        .expect_err("unparseable url should reject");
    assert_eq!(error.kind(), ErrorKind::InvalidInput);
}

#[test]
fn url_policy_rejects_private_hosts_when_installed() {
    let script = MockScript::new();
    script.route("/x", vec![ScriptedReply::ok("ok")]);
    let client =
        client_with(&script, Options::default()).with_url_policy(pledge::PublicAddressPolicy);

    let error = client
        .get("http://127.0.0.1/x")
        .send()
        .wait(Some(Duration::from_secs(1)))
        .expect_err("loopback should be rejected by the policy");
    assert!(matches!(error, Error::UrlRejected { .. }));
    assert_eq!(script.attempts().len(), 0);
}

#[test]
fn url_policy_screens_middleware_rewritten_urls() {
    let script = MockScript::new();
    script.route("/x", vec![ScriptedReply::ok("ok")]);
    let client = client_with(&script, Options::default())
        .with_middleware(middleware_fn(|mut request, next| {
            request.url = "http://127.0.0.1/x".to_owned();
            next.run(request)
        }))
        .with_url_policy(pledge::PublicAddressPolicy);

    let error = client
        .get("http://t/x")
        .send()
        .wait(Some(Duration::from_secs(1)))
        .expect_err("the rewritten loopback url must be rejected at submission");
    assert!(matches!(error, Error::UrlRejected { .. }));
    assert_eq!(script.attempts().len(), 0);
}

#[test]
fn teardown_closes_handles_and_leaves_queued_promises_pending() {
    let script = MockScript::new();
    script.route(
        "/slow",
        vec![ScriptedReply::ok("s").hold(Duration::from_millis(200))],
    );
    let client = client_with(&script, Options::default().with_max_concurrent(1));

    let active = client.get("http://t/slow").send();
    let queued = client.get("http://t/slow").send();
    assert_eq!(client.pending_count(), 1);
    assert_eq!(client.queued_count(), 1);

    drop(client);

    assert!(active.is_pending());
    assert!(queued.is_pending());
    assert!(script.closed_handles() >= 1, "active handle should be closed");
}
