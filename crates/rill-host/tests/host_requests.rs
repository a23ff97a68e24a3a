//! End-to-end request handling through an in-process host.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use rill_core::{Clock, ConfigNode, Message, SystemClock, Uri, headers, message};
use rill_host::{
    Access, EndpointRouter, Host, Service, ServiceRegistry, ServiceSetup, handler, verb,
};

struct EchoService;

#[async_trait::async_trait]
impl Service for EchoService {
    fn class(&self) -> &str {
        "test.echo"
    }

    fn setup(self: Arc<Self>, setup: &mut ServiceSetup) {
        setup.feature(
            verb::GET,
            "ping",
            "ping",
            handler(|_ctx, _msg| async { Ok(Message::ok_document(json!("pong"))) }),
        );

        setup.feature(
            verb::GET,
            "slow",
            "slow",
            handler(|_ctx, _msg| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Message::ok_document(json!("done")))
            }),
        );

        setup.feature(
            verb::GET,
            "recurse",
            "recurse",
            handler(|ctx, _msg| async move {
                let n: u32 = ctx.uri.query("n").and_then(|v| v.parse().ok()).unwrap_or(0);
                if n == 0 {
                    return Ok(Message::ok_document(json!(0)));
                }
                let next = ctx.uri.without("n").with("n", &(n - 1).to_string());
                let reply = ctx
                    .plug(&next)
                    .with_header(headers::REQUEST_ID, &ctx.request_id)
                    .get()
                    .await?;
                Ok(reply)
            }),
        );

        setup
            .feature(
                verb::GET,
                "secrets",
                "secrets",
                handler(|_ctx, _msg| async { Ok(Message::ok_document(json!("classified"))) }),
            )
            .access(Access::Internal);
    }
}

async fn test_host() -> Arc<Host> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let registry = ServiceRegistry::new();
    registry.register("test.echo", |_config| Ok(Arc::new(EchoService) as Arc<dyn Service>));
    let router = EndpointRouter::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let host = Host::start(
        ConfigNode::new(json!({ "dream.apikey": "master-key", "connect-limit": 1 })),
        registry,
        router,
        clock,
    )
    .await
    .expect("host start");
    host.start_service(ConfigNode::new(json!({ "path": "echo", "class": "test.echo" })))
        .await
        .expect("echo service");
    host
}

fn local(host: &Host, path_and_query: &str) -> Uri {
    Uri::parse(&format!("local://{}/{}", host.guid(), path_and_query)).unwrap()
}

#[tokio::test]
async fn normalizes_xpost_bodies_before_the_echo() {
    let host = test_host().await;
    let uri = local(&host, "host/test?dream.in.format=xpost");
    let request = Message::request_bytes(b"a=1&b=two".to_vec(), message::MIME_FORM_URLENCODED);
    let reply = host.submit("POST", uri, request).await;

    assert_eq!(reply.status, 200);
    let doc = reply.document().unwrap();
    assert_eq!(doc["body"], json!({ "a": "1", "b": "two" }));
    assert_eq!(doc["verb"], "POST");
}

#[tokio::test]
async fn unknown_paths_are_404_and_wrong_verbs_405() {
    let host = test_host().await;

    let reply = host
        .submit("GET", local(&host, "echo/nowhere"), Message::request())
        .await;
    assert_eq!(reply.status, 404);

    let reply = host
        .submit("DELETE", local(&host, "echo/ping"), Message::request())
        .await;
    assert_eq!(reply.status, 405);
    assert_eq!(reply.headers.get(headers::ALLOW), Some("GET"));
}

#[tokio::test]
async fn options_lists_allowed_verbs() {
    let host = test_host().await;
    let reply = host
        .submit("OPTIONS", local(&host, "echo/ping"), Message::request())
        .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.headers.get(headers::ALLOW), Some("GET"));
}

#[tokio::test]
async fn every_reply_carries_the_request_id() {
    let host = test_host().await;

    let reply = host
        .submit("GET", local(&host, "echo/ping"), Message::request())
        .await;
    assert!(reply.request_id().is_some());

    let mut request = Message::request();
    request.set_request_id("fixed-id");
    let reply = host
        .submit("GET", local(&host, "echo/ping"), request)
        .await;
    assert_eq!(reply.request_id(), Some("fixed-id"));
}

#[tokio::test]
async fn reentrancy_beyond_the_limit_is_503() {
    let host = test_host().await;
    // 25 nested hops with a shared request id exceeds the default limit of
    // 20.
    let reply = host
        .submit("GET", local(&host, "echo/recurse?n=25"), Message::request())
        .await;
    assert_eq!(reply.status, 503);

    // Shallow recursion passes and the in-flight table drains.
    let reply = host
        .submit("GET", local(&host, "echo/recurse?n=3"), Message::request())
        .await;
    assert_eq!(reply.status, 200);
    assert_eq!(host.activities().as_object().unwrap().len(), 0);
}

#[tokio::test]
async fn admission_queues_external_requests_over_the_limit() {
    let host = test_host().await;
    let uri = Uri::parse("http://front.example/echo/slow").unwrap();

    let started = Instant::now();
    let a = {
        let host = host.clone();
        let uri = uri.clone();
        tokio::spawn(async move { host.submit("GET", uri, Message::request()).await })
    };
    let b = {
        let host = host.clone();
        tokio::spawn(async move { host.submit("GET", uri, Message::request()).await })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(a.status, 200);
    assert_eq!(b.status, 200);
    // connect-limit is 1, so the second request waited for the first slot.
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test]
async fn transport_prefixes_are_memoized_as_aliases() {
    let host = test_host().await;
    let reply = host
        .submit(
            "GET",
            Uri::parse("http://front.example:8080/echo/ping").unwrap(),
            Message::request(),
        )
        .await;
    assert_eq!(reply.status, 200);
    assert!(
        host.aliases()
            .iter()
            .any(|a| a.to_string() == "http://front.example:8080")
    );
}

#[tokio::test]
async fn internal_features_need_a_service_key() {
    let host = test_host().await;

    let reply = host
        .submit("GET", local(&host, "echo/secrets"), Message::request())
        .await;
    assert_eq!(reply.status, 403);

    // The master api key grants private access everywhere.
    let reply = host
        .submit(
            "GET",
            local(&host, "echo/secrets?apikey=master-key"),
            Message::request(),
        )
        .await;
    assert_eq!(reply.status, 200);

    let entry = host
        .find_service(&local(&host, "echo"))
        .expect("echo entry");
    let request = Message::request()
        .with_header(headers::SERVICE_KEY, &entry.access_keys.internal);
    let reply = host
        .submit("GET", local(&host, "echo/secrets"), request)
        .await;
    assert_eq!(reply.status, 200);
}

#[tokio::test]
async fn services_can_be_created_and_stopped_over_rest() {
    let host = test_host().await;

    // Creation requires the api key.
    let body = Message::request_document(json!({ "path": "echo2", "class": "test.echo" }));
    let reply = host
        .submit("POST", local(&host, "host/services"), body.clone())
        .await;
    assert_eq!(reply.status, 403);

    let reply = host
        .submit(
            "POST",
            local(&host, "host/services?apikey=master-key"),
            body,
        )
        .await;
    assert_eq!(reply.status, 201);
    let created = reply.headers.get(headers::LOCATION).unwrap().to_string();

    let reply = host
        .submit("GET", local(&host, "echo2/ping"), Message::request())
        .await;
    assert_eq!(reply.status, 200);

    let stop = Message::request_document(json!({ "uri": created }));
    let reply = host
        .submit("POST", local(&host, "host/stop?apikey=master-key"), stop)
        .await;
    assert_eq!(reply.status, 200);

    let reply = host
        .submit("GET", local(&host, "echo2/ping"), Message::request())
        .await;
    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn scripts_execute_actions_and_pipes() {
    let host = test_host().await;
    let script = json!({
        "script": [
            { "action": { "verb": "GET", "path": "echo/ping", "id": "first" } },
            { "fork": [
                { "action": { "verb": "GET", "path": "host/version" } },
                { "action": { "verb": "GET", "path": "echo/ping" } }
            ]}
        ]
    });
    let reply = host
        .submit(
            "POST",
            local(&host, "host/execute?apikey=master-key"),
            Message::request_document(script),
        )
        .await;
    assert_eq!(reply.status, 200);
    let doc = reply.document().unwrap();
    let replies = doc["replies"].as_array().unwrap();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0]["id"], "first");
    assert_eq!(replies[0]["status"], 200);
}

#[tokio::test]
async fn select_and_format_shape_the_output() {
    let host = test_host().await;
    let reply = host
        .submit(
            "GET",
            local(&host, "host/version?dream.out.select=name"),
            Message::request(),
        )
        .await;
    assert_eq!(reply.document(), Some(json!("rill")));
}

#[tokio::test]
async fn shutdown_refuses_new_external_work() {
    let host = test_host().await;
    host.shutdown().await;

    let reply = host
        .submit(
            "GET",
            Uri::parse("http://front.example/echo/ping").unwrap(),
            Message::request(),
        )
        .await;
    assert_eq!(reply.status, 503);
}
