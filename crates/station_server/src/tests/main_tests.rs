use super::*;
use axum::{body, body::Body, http::Request};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use shared::domain::PollingStationId;
use tower::ServiceExt;

fn test_app(scanner_connected: bool) -> Router {
    let station = StationContext::new(
        [VoterId::new("VOTER-001")],
        MatchPolicy {
            similarity_threshold: 0.85,
            simulated_confidence: 0.92,
        },
        "COM3",
        ScannerState {
            connected: scanner_connected,
            port: scanner_connected.then(|| "COM3".to_string()),
        },
    );
    build_router(Arc::new(AppState { station }))
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn verify_body(factor: FactorKind) -> serde_json::Value {
    serde_json::to_value(VerifyRequest {
        factor_kind: factor,
        sample_b64: STANDARD.encode(b"sample"),
        voter_id: VoterId::new("VOTER-001"),
        polling_station: PollingStationId::new("PS-042"),
    })
    .expect("serialize")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = test_app(true).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn verify_route_decides_each_factor() {
    let app = test_app(true);
    for factor in FactorKind::ALL {
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/verify/{}", factor.path_segment()),
                verify_body(factor),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let decision: VerifyResponse = read_json(response).await;
        assert!(decision.success, "{factor} should pass");
    }
}

#[tokio::test]
async fn unknown_factor_is_not_found() {
    let response = test_app(true)
        .oneshot(post_json("/verify/retina", verify_body(FactorKind::Face)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ApiError = read_json(response).await;
    assert_eq!(error.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn disconnected_scanner_is_service_unavailable_until_connected() {
    let app = test_app(false);
    let response = app
        .clone()
        .oneshot(post_json(
            "/verify/fingerprint",
            verify_body(FactorKind::Fingerprint),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app
        .clone()
        .oneshot(post_json(
            "/scanner/connect",
            serde_json::json!({ "port": "COM5" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let status_request = Request::get("/scanner/status")
        .body(Body::empty())
        .expect("request");
    let status: ScannerStatusResponse =
        read_json(app.clone().oneshot(status_request).await.expect("response")).await;
    assert!(status.connected);
    assert_eq!(status.port.as_deref(), Some("COM5"));

    let response = app
        .oneshot(post_json(
            "/verify/fingerprint",
            verify_body(FactorKind::Fingerprint),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn vote_is_recorded_once_and_chain_verifies() {
    let app = test_app(true);
    let vote = serde_json::json!({
        "voter_id": "VOTER-001",
        "polling_station": "PS-042",
        "factor_evidence_refs": ["0xaaa", "0xbbb"],
    });

    let response = app
        .clone()
        .oneshot(post_json("/vote", vote.clone()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let cast: CastVoteResponse = read_json(response).await;
    assert!(cast.success);

    let response = app
        .clone()
        .oneshot(post_json("/vote", vote))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error: ApiError = read_json(response).await;
    assert_eq!(error.code, ErrorCode::AlreadyVoted);

    let ledger_request = Request::get("/ledger").body(Body::empty()).expect("request");
    let blocks: Vec<LedgerBlock> =
        read_json(app.clone().oneshot(ledger_request).await.expect("response")).await;
    assert_eq!(blocks.len(), 1);
    assert_eq!(cast.transaction_ref, format!("0x{}", blocks[0].hash));

    let audit_request = Request::get("/ledger/verify")
        .body(Body::empty())
        .expect("request");
    let audit: LedgerAudit = read_json(app.oneshot(audit_request).await.expect("response")).await;
    assert!(audit.valid);
    assert_eq!(audit.blocks, 1);
}

#[tokio::test]
async fn config_route_and_enrollment() {
    let app = test_app(true);
    let response = app
        .clone()
        .oneshot(post_json(
            "/register",
            serde_json::json!({
                "voter_id": "VOTER-001",
                "sample_b64": STANDARD.encode(b"sample"),
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let enrolled: RegisterFingerprintResponse = read_json(response).await;
    assert!(enrolled.success);

    let response = app
        .clone()
        .oneshot(post_json(
            "/register",
            serde_json::json!({ "voter_id": "VOTER-001", "sample_b64": "***" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let config_request = Request::get("/config").body(Body::empty()).expect("request");
    let config: StationConfigResponse =
        read_json(app.oneshot(config_request).await.expect("response")).await;
    assert_eq!(config.similarity_threshold, 0.85);
    assert_eq!(config.enrolled_fingerprints, 1);
}
