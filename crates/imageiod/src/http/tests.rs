//! Handler tests driving the routers in process with file backed tickets.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use imageio_proto::{defaults, TicketSpec, Verb};

use crate::auth::Authorizer;
use crate::config::{
    Config, ControlConfig, ControlTransport, DaemonConfig, LocalConfig, RemoteConfig, TlsConfig,
};
use crate::http::{control_router, data_router, AppState};

fn test_config() -> Config {
    Config {
        daemon: DaemonConfig {
            buffer_size: 64 * 1024,
            max_connections: 8,
            inactivity_timeout: Duration::from_secs(60),
        },
        tls: TlsConfig {
            cert_file: None,
            key_file: None,
            ca_file: None,
            enable_tls1_1: false,
            insecure_proxy: false,
        },
        remote: RemoteConfig {
            host: "127.0.0.1".into(),
            port: defaults::REMOTE_PORT,
        },
        local: LocalConfig {
            enable: true,
            socket: "@/test/imageio".into(),
        },
        control: ControlConfig {
            transport: ControlTransport::Tcp(defaults::CONTROL_PORT),
        },
    }
}

struct Env {
    control: Router,
    data: Router,
    auth: Arc<Authorizer>,
    _image: tempfile::NamedTempFile,
    image_path: String,
}

fn env_with_image(size: usize) -> Env {
    let mut image = tempfile::NamedTempFile::new().unwrap();
    image.as_file_mut().set_len(size as u64).unwrap();
    image.flush().unwrap();
    let image_path = image.path().to_str().unwrap().to_string();

    let auth = Authorizer::new(Duration::from_secs(60));
    let cfg = Arc::new(test_config());
    let control_state = AppState {
        auth: Arc::clone(&auth),
        cfg: Arc::clone(&cfg),
        control: true,
    };
    let data_state = AppState {
        auth: Arc::clone(&auth),
        cfg,
        control: false,
    };
    Env {
        control: control_router(control_state),
        data: data_router(data_state),
        auth,
        _image: image,
        image_path,
    }
}

impl Env {
    fn ticket(&self, uuid: &str, size: u64, ops: &[Verb], sparse: bool) -> TicketSpec {
        TicketSpec {
            uuid: uuid.into(),
            size,
            url: format!("file://{}", self.image_path),
            timeout: 300,
            ops: ops.to_vec(),
            sparse,
            dirty: false,
            inactivity_timeout: None,
            transfer_id: None,
            filename: None,
        }
    }

    fn write_image(&self, offset: u64, data: &[u8]) {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(Path::new(&self.image_path))
            .unwrap();
        file.write_all_at(data, offset).unwrap();
        file.sync_all().unwrap();
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap_or_default()
        .to_vec();
    (status, headers, body)
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn install(env: &Env, spec: &TicketSpec) {
    let body = serde_json::to_vec(spec).unwrap();
    let req = Request::builder()
        .method(Method::PUT)
        .uri(format!("/tickets/{}", spec.uuid))
        .body(Body::from(body))
        .unwrap();
    let (status, _, _) = send(&env.control, req).await;
    assert_eq!(status, StatusCode::OK);
}

// ─── Scenario: install, ranged GET, delete ──────────────────────────────────

#[tokio::test]
async fn test_install_get_range_delete() {
    let env = env_with_image(1024 * 1024);
    env.write_image(0x100, &[0xab]);
    install(&env, &env.ticket("t1", 1024 * 1024, &[Verb::Read], false)).await;

    let mut req = request(Method::GET, "/images/t1");
    req.headers_mut()
        .insert(header::RANGE, "bytes=256-256".parse().unwrap());
    let (status, headers, body) = send(&env.control, req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes 256-256/*");
    assert_eq!(headers[header::CONTENT_LENGTH], "1");
    assert_eq!(body, vec![0xab]);

    let (status, _, _) = send(&env.control, request(Method::DELETE, "/tickets/t1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send(&env.control, request(Method::GET, "/images/t1")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_get_whole_image() {
    let env = env_with_image(4096);
    env.write_image(0, &[0x5a; 4096]);
    install(&env, &env.ticket("t1", 4096, &[Verb::Read], false)).await;

    let (status, headers, body) = send(&env.data, request(Method::GET, "/images/t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_LENGTH], "4096");
    assert_eq!(
        headers[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(body, vec![0x5a; 4096]);
}

#[tokio::test]
async fn test_get_filename_in_disposition() {
    let env = env_with_image(4096);
    let mut spec = env.ticket("t1", 4096, &[Verb::Read], false);
    spec.filename = Some("disk.raw".into());
    install(&env, &spec).await;

    let (status, headers, _) = send(&env.data, request(Method::GET, "/images/t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=disk.raw"
    );
}

// ─── Scenario: range out of bounds ──────────────────────────────────────────

#[tokio::test]
async fn test_range_out_of_bounds() {
    let env = env_with_image(1000);
    install(&env, &env.ticket("t1", 1000, &[Verb::Read], false)).await;

    let mut req = request(Method::GET, "/images/t1");
    req.headers_mut()
        .insert(header::RANGE, "bytes=0-1000".parse().unwrap());
    let (status, headers, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes */1000");
}

#[tokio::test]
async fn test_open_ended_range_reads_to_end() {
    let env = env_with_image(1000);
    env.write_image(990, &[0x77; 10]);
    install(&env, &env.ticket("t1", 1000, &[Verb::Read], false)).await;

    let mut req = request(Method::GET, "/images/t1");
    req.headers_mut()
        .insert(header::RANGE, "bytes=990-".parse().unwrap());
    let (status, headers, body) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes 990-999/*");
    assert_eq!(body, vec![0x77; 10]);
}

// ─── Scenario: PUT with flush semantics ─────────────────────────────────────

#[tokio::test]
async fn test_put_flush_cycle() {
    let env = env_with_image(8192);
    install(
        &env,
        &env.ticket("t1", 8192, &[Verb::Read, Verb::Write], false),
    )
    .await;

    let payload: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/images/t1?flush=n")
        .header(header::CONTENT_RANGE, "bytes 0-4095/*")
        .header(header::CONTENT_LENGTH, "4096")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .method(Method::PATCH)
        .uri("/images/t1")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"op":"flush"}"#))
        .unwrap();
    let (status, _, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::OK);

    let mut req = request(Method::GET, "/images/t1");
    req.headers_mut()
        .insert(header::RANGE, "bytes=0-4095".parse().unwrap());
    let (status, _, body) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, payload);
}

#[tokio::test]
async fn test_put_requires_content_length() {
    let env = env_with_image(8192);
    install(&env, &env.ticket("t1", 8192, &[Verb::Write], false)).await;

    // A raw request without body and without content-length.
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/images/t1")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_put_at_content_range_offset() {
    let env = env_with_image(8192);
    install(
        &env,
        &env.ticket("t1", 8192, &[Verb::Read, Verb::Write], false),
    )
    .await;

    let req = Request::builder()
        .method(Method::PUT)
        .uri("/images/t1")
        .header(header::CONTENT_RANGE, "bytes 4096-4099/*")
        .header(header::CONTENT_LENGTH, "4")
        .body(Body::from(&b"data"[..]))
        .unwrap();
    let (status, _, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::OK);

    let mut req = request(Method::GET, "/images/t1");
    req.headers_mut()
        .insert(header::RANGE, "bytes=4096-4099".parse().unwrap());
    let (_, _, body) = send(&env.data, req).await;
    assert_eq!(body, b"data");
}

#[tokio::test]
async fn test_put_beyond_image_is_rejected() {
    let env = env_with_image(1000);
    install(&env, &env.ticket("t1", 1000, &[Verb::Write], false)).await;

    let req = Request::builder()
        .method(Method::PUT)
        .uri("/images/t1")
        .header(header::CONTENT_RANGE, "bytes 900-1099/*")
        .header(header::CONTENT_LENGTH, "200")
        .body(Body::from(vec![0u8; 200]))
        .unwrap();
    let (status, headers, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes */1000");
}

// ─── Scenario: read-only tickets ────────────────────────────────────────────

#[tokio::test]
async fn test_read_only_ticket_rejects_writes() {
    let env = env_with_image(8192);
    install(&env, &env.ticket("t1", 8192, &[Verb::Read], false)).await;

    let req = Request::builder()
        .method(Method::PUT)
        .uri("/images/t1")
        .header(header::CONTENT_LENGTH, "1")
        .body(Body::from(&b"x"[..]))
        .unwrap();
    let (status, _, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    for body in [
        r#"{"op":"zero","size":512}"#,
        r#"{"op":"flush"}"#,
    ] {
        let req = Request::builder()
            .method(Method::PATCH)
            .uri("/images/t1")
            .body(Body::from(body))
            .unwrap();
        let (status, _, _) = send(&env.data, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "accepted {body}");
    }
}

// ─── Scenario: PATCH zero with sparse ticket ────────────────────────────────

#[tokio::test]
async fn test_patch_zero_sparse() {
    let env = env_with_image(10 * 1024 * 1024);
    env.write_image(0, &[0xcd; 256 * 1024]);
    install(
        &env,
        &env.ticket("t1", 10 * 1024 * 1024, &[Verb::Read, Verb::Write], true),
    )
    .await;

    let req = Request::builder()
        .method(Method::PATCH)
        .uri("/images/t1")
        .body(Body::from(r#"{"op":"zero","offset":65536,"size":65536}"#))
        .unwrap();
    let (status, _, _) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::OK);

    let mut req = request(Method::GET, "/images/t1");
    req.headers_mut()
        .insert(header::RANGE, "bytes=65536-131071".parse().unwrap());
    let (status, _, body) = send(&env.data, req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert!(body.iter().all(|b| *b == 0));

    // The zeroed range shows up in the extents report.
    let (status, _, body) =
        send(&env.data, request(Method::GET, "/images/t1/extents")).await;
    assert_eq!(status, StatusCode::OK);
    let extents: Vec<imageio_proto::Extent> = serde_json::from_slice(&body).unwrap();
    let mut pos = 0;
    for ext in &extents {
        assert_eq!(ext.start, pos, "extents not gap-free: {extents:?}");
        pos += ext.length;
    }
    assert!(extents
        .iter()
        .any(|e| e.zero && e.start <= 65536 && e.start + e.length >= 131072));
}

#[tokio::test]
async fn test_patch_bad_requests() {
    let env = env_with_image(8192);
    install(&env, &env.ticket("t1", 8192, &[Verb::Write], false)).await;

    for body in [
        r#"{"op":"trim","size":512}"#,
        r#"{"op":"zero"}"#,
        r#"not json"#,
    ] {
        let req = Request::builder()
            .method(Method::PATCH)
            .uri("/images/t1")
            .body(Body::from(body))
            .unwrap();
        let (status, _, _) = send(&env.data, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "accepted {body}");
    }
}

// ─── OPTIONS ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_options_read_only() {
    let env = env_with_image(8192);
    install(&env, &env.ticket("t1", 8192, &[Verb::Read], false)).await;

    let (status, headers, body) = send(&env.data, request(Method::OPTIONS, "/images/t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ALLOW], "OPTIONS,GET");

    let options: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let features = options["features"].as_array().unwrap();
    assert!(features.contains(&serde_json::json!("extents")));
    assert!(!features.contains(&serde_json::json!("zero")));
    assert_eq!(options["max_writers"], 1);
    assert!(options["unix_socket"].is_string());
}

#[tokio::test]
async fn test_options_read_write() {
    let env = env_with_image(8192);
    install(
        &env,
        &env.ticket("t1", 8192, &[Verb::Read, Verb::Write], false),
    )
    .await;

    let (status, headers, body) = send(&env.data, request(Method::OPTIONS, "/images/t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ALLOW], "OPTIONS,GET,PUT,PATCH");

    let options: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let features = options["features"].as_array().unwrap();
    for feature in ["extents", "zero", "flush"] {
        assert!(
            features.contains(&serde_json::json!(feature)),
            "missing {feature} in {features:?}"
        );
    }
}

#[tokio::test]
async fn test_options_wildcard_control_only() {
    let env = env_with_image(8192);

    let (status, _, body) = send(&env.control, request(Method::OPTIONS, "/images/*")).await;
    assert_eq!(status, StatusCode::OK);
    let options: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        options["features"],
        serde_json::json!(["extents", "zero", "flush"])
    );

    // The wildcard is not reachable on the remote data listener.
    let (status, _, _) = send(&env.data, request(Method::OPTIONS, "/images/*")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ─── Extents ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_extents_dirty_requires_dirty_ticket() {
    let env = env_with_image(8192);
    install(&env, &env.ticket("t1", 8192, &[Verb::Read], false)).await;

    let (status, _, _) = send(
        &env.data,
        request(Method::GET, "/images/t1/extents?context=dirty"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(
        &env.data,
        request(Method::GET, "/images/t1/extents?context=bogus"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─── Ticket resource ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ticket_lifecycle() {
    let env = env_with_image(8192);
    let spec = env.ticket("t1", 8192, &[Verb::Read], false);
    install(&env, &spec).await;

    // Status snapshot.
    let (status, _, body) = send(&env.control, request(Method::GET, "/tickets/t1")).await;
    assert_eq!(status, StatusCode::OK);
    let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["uuid"], "t1");
    assert_eq!(info["size"], 8192);
    assert_eq!(info["connections"], 0);
    assert_eq!(info["transferred"], 0);

    // Listing.
    let (status, _, body) = send(&env.control, request(Method::GET, "/tickets")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids, vec!["t1"]);

    // Expire with timeout 0, then data access fails.
    let req = Request::builder()
        .method(Method::PATCH)
        .uri("/tickets/t1")
        .body(Body::from(r#"{"timeout": 0}"#))
        .unwrap();
    let (status, _, _) = send(&env.control, req).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&env.data, request(Method::GET, "/images/t1")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Revive and access again.
    let req = Request::builder()
        .method(Method::PATCH)
        .uri("/tickets/t1")
        .body(Body::from(r#"{"timeout": 300}"#))
        .unwrap();
    let (status, _, _) = send(&env.control, req).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&env.data, request(Method::GET, "/images/t1")).await;
    assert_eq!(status, StatusCode::OK);

    // Delete is idempotent.
    let (status, _, _) = send(&env.control, request(Method::DELETE, "/tickets/t1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send(&env.control, request(Method::DELETE, "/tickets/t1")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send(&env.control, request(Method::GET, "/tickets/t1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ticket_install_validation() {
    let env = env_with_image(8192);

    // Unknown field.
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/tickets/t1")
        .body(Body::from(
            r#"{"uuid":"t1","size":1,"url":"file:///i","timeout":1,"ops":["read"],"bogus":1}"#,
        ))
        .unwrap();
    let (status, _, _) = send(&env.control, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Path and body uuid mismatch.
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/tickets/t1")
        .body(Body::from(
            r#"{"uuid":"t2","size":1,"url":"file:///i","timeout":1,"ops":["read"]}"#,
        ))
        .unwrap();
    let (status, _, _) = send(&env.control, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ticket_replace_keeps_id_usable() {
    let env = env_with_image(8192);
    install(&env, &env.ticket("t1", 4096, &[Verb::Read], false)).await;
    install(&env, &env.ticket("t1", 8192, &[Verb::Read], false)).await;

    let ticket = env.auth.get("t1").unwrap();
    assert_eq!(ticket.size(), 8192);
}

#[tokio::test]
async fn test_data_router_has_no_ticket_routes() {
    let env = env_with_image(8192);
    install(&env, &env.ticket("t1", 8192, &[Verb::Read], false)).await;

    let (status, _, _) = send(&env.data, request(Method::GET, "/tickets/t1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
