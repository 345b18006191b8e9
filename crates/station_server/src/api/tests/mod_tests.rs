use super::*;
use shared::domain::PollingStationId;

fn context(simulated_confidence: f64, scanner_connected: bool) -> StationContext {
    StationContext::new(
        [VoterId::new("VOTER-001"), VoterId::new("VOTER-002")],
        MatchPolicy {
            similarity_threshold: 0.85,
            simulated_confidence,
        },
        "COM3",
        ScannerState {
            connected: scanner_connected,
            port: scanner_connected.then(|| "COM3".to_string()),
        },
    )
}

fn request(voter: &str, factor: FactorKind) -> VerifyRequest {
    VerifyRequest {
        factor_kind: factor,
        sample_b64: STANDARD.encode(b"sample"),
        voter_id: VoterId::new(voter),
        polling_station: PollingStationId::new("PS-042"),
    }
}

#[tokio::test]
async fn registered_voter_passes_identity_lookup() {
    let ctx = context(0.92, true);
    let response = verify_factor(
        &ctx,
        FactorKind::IdentityLookup,
        request("VOTER-001", FactorKind::IdentityLookup),
    )
    .await
    .expect("verify");
    assert!(response.success);
    assert_eq!(response.confidence, 1.0);
    assert!(response.evidence_ref.starts_with("0x"));
    assert_eq!(response.evidence_ref.len(), 34);
}

#[tokio::test]
async fn unknown_voter_is_rejected_not_errored() {
    let ctx = context(0.92, true);
    let response = verify_factor(
        &ctx,
        FactorKind::Face,
        request("VOTER-404", FactorKind::Face),
    )
    .await
    .expect("verify");
    assert!(!response.success);
    assert!(response.evidence_ref.is_empty());
}

#[tokio::test]
async fn biometric_below_threshold_is_rejected() {
    let ctx = context(0.60, true);
    let response = verify_factor(
        &ctx,
        FactorKind::Face,
        request("VOTER-001", FactorKind::Face),
    )
    .await
    .expect("verify");
    assert!(!response.success);
    assert_eq!(response.confidence, 0.60);
}

#[tokio::test]
async fn fingerprint_needs_connected_scanner() {
    let ctx = context(0.92, false);
    let err = verify_factor(
        &ctx,
        FactorKind::Fingerprint,
        request("VOTER-001", FactorKind::Fingerprint),
    )
    .await
    .expect_err("scanner offline");
    assert_eq!(err.code, ErrorCode::DeviceUnavailable);

    connect_scanner(&ctx, Some("COM7".to_string())).await;
    let response = verify_factor(
        &ctx,
        FactorKind::Fingerprint,
        request("VOTER-001", FactorKind::Fingerprint),
    )
    .await
    .expect("verify");
    assert!(response.success);
}

#[tokio::test]
async fn mismatched_or_empty_samples_are_validation_errors() {
    let ctx = context(0.92, true);
    let err = verify_factor(
        &ctx,
        FactorKind::Face,
        request("VOTER-001", FactorKind::Fingerprint),
    )
    .await
    .expect_err("factor mismatch");
    assert_eq!(err.code, ErrorCode::Validation);

    let mut empty = request("VOTER-001", FactorKind::Face);
    empty.sample_b64 = String::new();
    let err = verify_factor(&ctx, FactorKind::Face, empty)
        .await
        .expect_err("empty sample");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn second_vote_is_already_voted() {
    let ctx = context(0.92, true);
    let vote = CastVoteRequest {
        voter_id: VoterId::new("VOTER-002"),
        polling_station: PollingStationId::new("PS-042"),
        factor_evidence_refs: vec!["0xabc".to_string()],
    };

    let first = cast_vote(&ctx, vote.clone()).await.expect("vote");
    assert!(first.success);
    assert_eq!(first.transaction_ref.len(), 66);

    let err = cast_vote(&ctx, vote).await.expect_err("duplicate");
    assert_eq!(err.code, ErrorCode::AlreadyVoted);
    assert_eq!(ledger_blocks(&ctx).await.len(), 1);
}

#[tokio::test]
async fn unregistered_voter_cannot_vote() {
    let ctx = context(0.92, true);
    let err = cast_vote(
        &ctx,
        CastVoteRequest {
            voter_id: VoterId::new("VOTER-404"),
            polling_station: PollingStationId::new("PS-042"),
            factor_evidence_refs: vec!["0xabc".to_string()],
        },
    )
    .await
    .expect_err("not on roster");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn scanner_connect_defaults_port_and_disconnect_clears_it() {
    let ctx = context(0.92, false);
    assert!(!scanner_status(&ctx).await.connected);

    let connected = connect_scanner(&ctx, None).await;
    assert_eq!(connected.port.as_deref(), Some("COM3"));
    assert!(scanner_status(&ctx).await.connected);

    disconnect_scanner(&ctx).await;
    assert_eq!(
        scanner_status(&ctx).await,
        ScannerStatusResponse {
            connected: false,
            port: None
        }
    );
}

fn enrollment(voter: &str, scan: &[u8]) -> RegisterFingerprintRequest {
    RegisterFingerprintRequest {
        voter_id: VoterId::new(voter),
        sample_b64: STANDARD.encode(scan),
    }
}

#[tokio::test]
async fn enrolled_fingerprint_must_match_the_scan() {
    let ctx = context(0.92, true);
    let enrolled = register_fingerprint(&ctx, enrollment("VOTER-001", b"sample"))
        .await
        .expect("enroll");
    assert!(enrolled.success);

    let matching = verify_factor(
        &ctx,
        FactorKind::Fingerprint,
        request("VOTER-001", FactorKind::Fingerprint),
    )
    .await
    .expect("verify");
    assert!(matching.success);

    let mut other = request("VOTER-001", FactorKind::Fingerprint);
    other.sample_b64 = STANDARD.encode(b"someone else");
    let mismatch = verify_factor(&ctx, FactorKind::Fingerprint, other)
        .await
        .expect("verify");
    assert!(!mismatch.success);
    assert_eq!(mismatch.confidence, 0.0);

    // Voters without a template still use the simulated matcher.
    let unenrolled = verify_factor(
        &ctx,
        FactorKind::Fingerprint,
        request("VOTER-002", FactorKind::Fingerprint),
    )
    .await
    .expect("verify");
    assert!(unenrolled.success);
}

#[tokio::test]
async fn enrollment_is_validated() {
    let ctx = context(0.92, true);
    let unknown = register_fingerprint(&ctx, enrollment("VOTER-404", b"scan"))
        .await
        .expect_err("not on roster");
    assert_eq!(unknown.code, ErrorCode::NotFound);

    let empty = register_fingerprint(&ctx, enrollment("VOTER-001", b""))
        .await
        .expect_err("empty scan");
    assert_eq!(empty.code, ErrorCode::Validation);

    register_fingerprint(&ctx, enrollment("VOTER-001", b"scan"))
        .await
        .expect("first enrollment");
    let again = register_fingerprint(&ctx, enrollment("VOTER-001", b"scan"))
        .await
        .expect_err("already enrolled");
    assert_eq!(again.code, ErrorCode::Validation);

    let offline = context(0.92, false);
    let err = register_fingerprint(&offline, enrollment("VOTER-002", b"scan"))
        .await
        .expect_err("scanner offline");
    assert_eq!(err.code, ErrorCode::DeviceUnavailable);
}

#[tokio::test]
async fn config_reports_threshold_and_counts() {
    let ctx = context(0.92, true);
    register_fingerprint(&ctx, enrollment("VOTER-002", b"scan"))
        .await
        .expect("enroll");

    let config = station_config(&ctx).await;
    assert_eq!(config.similarity_threshold, 0.85);
    assert_eq!(config.registered_voters, 2);
    assert_eq!(config.enrolled_fingerprints, 1);
    assert!(!config.version.is_empty());
}
