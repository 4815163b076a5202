//! End-to-end tests that drive a real in-process hyper server the way an
//! operator's client would: over TCP, against the full dispatcher stack
//! (store, rule evaluator, executor), covering the scenarios in spec §8.

use std::convert::Infallible;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hookforge::config::Config;
use hookforge::dispatcher::Dispatcher;
use hookforge::executor::{Executor, ExecutorConfig};
use hookforge::ext::{NoopAudit, NoopRateLimiter};
use hookforge::hook::{
    ArgumentSource, Hook, MatchRule, MatchType, ParamRef, ResponseHeader, TriggerRule,
};
use hookforge::logging;
use hookforge::metrics::Metrics;
use hookforge::store::HookStore;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Server, StatusCode};

fn bare_hook(id: &str, command: String) -> Hook {
    Hook {
        id: id.to_string(),
        execute_command: command,
        command_working_directory: None,
        http_methods: vec![],
        response_message: "ok".to_string(),
        response_headers: vec![],
        capture_output: true,
        capture_output_on_error: false,
        stream_output: false,
        success_http_code: None,
        trigger_rule_mismatch_http_code: None,
        incoming_content_type: None,
        trigger_signature_soft_failures: false,
        pass_arguments: vec![],
        pass_environment: vec![],
        pass_file: vec![],
        json_string_parameters: vec![],
        trigger_rule: None,
    }
}

fn shell_script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "#!/bin/sh\n{body}").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.display().to_string()
}

/// Spawns a real TCP listener running the full dispatcher stack, the same
/// wiring `main.rs` does minus CLI/config-file parsing, and returns its
/// address. The server task is detached; it lives for the process/test's
/// duration, which is fine for these short-lived tests.
async fn spawn_server(dir: &tempfile::TempDir, hooks: Vec<Hook>, config: Config) -> SocketAddr {
    let config = Arc::new(config);
    let store = Arc::new(HookStore::new());
    store
        .replace_file(dir.path().join("hooks.json"), hooks)
        .await
        .unwrap();

    let executor = Arc::new(Executor::new(ExecutorConfig {
        max_concurrent_hooks: config.max_concurrent_hooks,
        slot_acquisition_timeout: config.slot_acquisition_timeout(),
        hook_timeout: config.hook_timeout(),
        allowed_command_paths: vec![],
        allow_auto_chmod: false,
    }));
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        store,
        executor,
        metrics,
        Arc::new(NoopAudit),
        Arc::new(NoopRateLimiter),
    ));

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let make_svc = make_service_fn(move |_conn: &hyper::server::conn::AddrStream| {
        let dispatcher = dispatcher.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let dispatcher = dispatcher.clone();
                async move {
                    let remote = SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 5555));
                    let mut log = logging::log_context(&remote);
                    dispatcher.dispatch(req, remote, &mut log).await
                }
            }))
        }
    });
    let server = Server::bind(&addr).serve(make_svc);
    let bound = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    bound
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.max_concurrent_hooks = 10;
    config.slot_acquisition_timeout_seconds = 5;
    config.hook_timeout_seconds = 30;
    config
}

#[tokio::test]
async fn hmac_push_hook_matches_and_mismatch_falls_through() {
    let dir = tempfile::tempdir().unwrap();
    let command = shell_script(&dir, "hook.sh", "echo deployed");
    let mut hook = bare_hook("push", command);
    hook.trigger_rule = Some(TriggerRule::And(vec![
        TriggerRule::Match(MatchRule {
            match_type: MatchType::PayloadHmacSha1,
            parameter: ParamRef {
                source: ArgumentSource::Header,
                name: "X-Hub-Signature".to_string(),
            },
            value: None,
            regex: None,
            secret: Some("foo\"123".to_string()),
            ip_range: None,
        }),
        TriggerRule::Match(MatchRule {
            match_type: MatchType::Value,
            parameter: ParamRef {
                source: ArgumentSource::Payload,
                name: "ref".to_string(),
            },
            value: Some("refs/heads/master".to_string()),
            regex: None,
            secret: None,
            ip_range: None,
        }),
    ]));
    let addr = spawn_server(&dir, vec![hook], base_config()).await;

    let body = br#"{"ref":"refs/heads/master"}"#.to_vec();
    let (mac, _) = hookforge::signature::verify_hmac(
        hookforge::signature::HmacAlgo::Sha1,
        b"foo\"123",
        &body,
        "",
    );

    let client = Client::new();
    let uri: hyper::Uri = format!("http://{addr}/hooks/push").parse().unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri.clone())
        .header("X-Hub-Signature", format!("sha1={mac}"))
        .header("content-type", "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let out = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert!(String::from_utf8_lossy(&out).contains("deployed"));

    // Mutate one hex digit of the MAC: the hook rules must no longer be
    // satisfied, and the server must not have run the command a second time
    // for a bad signature.
    let mut bad_mac = mac.clone();
    let last = bad_mac.pop().unwrap();
    bad_mac.push(if last == '0' { '1' } else { '0' });
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("X-Hub-Signature", format!("sha1={bad_mac}"))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let out = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(out, "Hook rules were not satisfied.".as_bytes());
}

#[tokio::test]
async fn slow_hook_times_out_with_408_and_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let command = shell_script(&dir, "slow.sh", "sleep 10");
    let hook = bare_hook("slow", command);
    let mut config = base_config();
    config.hook_timeout_seconds = 1;
    let addr = spawn_server(&dir, vec![hook], config).await;

    let client = Client::new();
    let uri: hyper::Uri = format!("http://{addr}/hooks/slow").parse().unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let resp = tokio::time::timeout(Duration::from_secs(5), client.request(req))
        .await
        .expect("request should not hang past the hook timeout")
        .unwrap();
    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    let out = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert!(String::from_utf8_lossy(&out).to_lowercase().contains("timeout"));

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|n| n != "slow.sh")
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
}

#[tokio::test]
async fn concurrency_cap_limits_simultaneous_executions() {
    let dir = tempfile::tempdir().unwrap();
    let command = shell_script(&dir, "sleep.sh", "sleep 2");
    let hook = bare_hook("busy", command);
    let mut config = base_config();
    config.max_concurrent_hooks = 2;
    config.slot_acquisition_timeout_seconds = 1;
    let addr = spawn_server(&dir, vec![hook], config).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let uri: hyper::Uri = format!("http://{addr}/hooks/busy").parse().unwrap();
        handles.push(tokio::spawn(async move {
            let client = Client::new();
            let req = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            client.request(req).await.unwrap().status()
        }));
    }

    let mut ok = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::SERVICE_UNAVAILABLE => rejected += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(rejected, 3);
}

#[tokio::test]
async fn ip_whitelist_gates_on_remote_address() {
    let dir = tempfile::tempdir().unwrap();
    let command = shell_script(&dir, "hook.sh", "echo allowed");
    let mut hook = bare_hook("fenced", command);
    hook.trigger_rule = Some(TriggerRule::Match(MatchRule {
        match_type: MatchType::IpWhitelist,
        parameter: ParamRef {
            source: ArgumentSource::Request,
            name: "remote-addr".to_string(),
        },
        value: None,
        regex: None,
        secret: None,
        ip_range: Some("127.0.0.0/8".to_string()),
    }));
    let addr = spawn_server(&dir, vec![hook], base_config()).await;

    // All test clients connect from 127.0.0.1, which is inside 127.0.0.0/8,
    // so this should match and run the command.
    let client = Client::new();
    let uri: hyper::Uri = format!("http://{addr}/hooks/fenced").parse().unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let out = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert!(String::from_utf8_lossy(&out).contains("allowed"));
}

#[tokio::test]
async fn global_and_hook_response_headers_are_merged() {
    let dir = tempfile::tempdir().unwrap();
    let command = shell_script(&dir, "hook.sh", "echo ok");
    let mut hook = bare_hook("headered", command);
    hook.response_headers = vec![ResponseHeader {
        name: "X-Hook-Specific".to_string(),
        value: "from-hook".to_string(),
    }];
    let mut config = base_config();
    config.global_response_headers = vec![ResponseHeader {
        name: "X-Global".to_string(),
        value: "from-operator".to_string(),
    }];
    let addr = spawn_server(&dir, vec![hook], config).await;

    let client = Client::new();
    let uri: hyper::Uri = format!("http://{addr}/hooks/headered").parse().unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("X-Global").unwrap(), "from-operator");
    assert_eq!(resp.headers().get("X-Hook-Specific").unwrap(), "from-hook");
    assert!(resp.headers().contains_key("X-Request-Id"));
}

#[tokio::test]
async fn health_and_version_endpoints_respond_without_a_hook() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(&dir, vec![], base_config()).await;
    let client = Client::new();

    for route in ["/health", "/livez", "/readyz", "/"] {
        let uri: hyper::Uri = format!("http://{addr}{route}").parse().unwrap();
        let resp = client.get(uri).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "route {route}");
    }

    let uri: hyper::Uri = format!("http://{addr}/version").parse().unwrap();
    let resp = client.get(uri).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let out = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert!(String::from_utf8_lossy(&out).contains("hookforge"));
}
