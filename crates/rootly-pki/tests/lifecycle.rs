//! End-to-end tests for the certificate lifecycle.
//!
//! These tests verify:
//! 1. CA creation and listing
//! 2. Leaf issuance and the resulting chain
//! 3. Wrong passphrases leave no trace
//! 4. Serial uniqueness under concurrent signing, within and across engines
//! 5. Listing never observes half-created CAs
//! 6. Upload cross-validation

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use rootly_pki::{
    ArtifactKind, ArtifactScope, CaId, Certificate, CreateCaRequest, ErrorKind, KdfParams, Pki,
    PkiConfig, SignRequest, UploadRequest, validate_certificate, validate_chain,
};

fn pki(dir: &Path) -> Pki {
    Pki::new(
        PkiConfig::new(dir.join("ca"), dir.join("certs"))
            .with_kdf(KdfParams::insecure_fast())
            .with_lock_timeout(Duration::from_secs(30)),
    )
}

fn create(pki: &Pki, id: &str, cn: &str, pw: &str, days: u32) {
    let request = CreateCaRequest::builder()
        .id(id)
        .common_name(cn)
        .organization("Acme")
        .passphrase(pw)
        .validity_days(days)
        .build()
        .unwrap();
    pki.create_ca(&request).unwrap();
}

fn sign(host: &str, ca: &str, pw: &str, days: u32) -> SignRequest {
    SignRequest::builder(host)
        .ca(ca)
        .passphrase(pw)
        .validity_days(days)
        .build()
        .unwrap()
}

// ============================================================================
// Scenario
// ============================================================================

#[test]
fn test_create_sign_and_reject_wrong_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());

    create(&pki, "prod", "Prod Root", "pw1", 3650);
    let cas = pki.list_cas().unwrap();
    assert_eq!(cas.len(), 1);
    assert_eq!(cas[0].id.as_str(), "prod");
    assert_eq!(cas[0].subject_dn.common_name, "Prod Root");
    let expected = Utc::now() + chrono::Duration::days(3650);
    assert!((cas[0].not_after - expected).num_hours().abs() <= 24);

    let signed = pki
        .sign_certificate(&sign("api.acme.local", "prod", "pw1", 365))
        .unwrap();
    assert_eq!(signed.serial, "01");

    let certs_dir = dir.path().join("certs");
    for name in ["api.acme.local.crt", "api.acme.local.key", "api.acme.local_fullchain.crt"] {
        assert!(certs_dir.join(name).is_file(), "missing {name}");
    }

    let fullchain = pki
        .export_artifact(ArtifactScope::Cert, "api.acme.local", ArtifactKind::Fullchain)
        .unwrap();
    let chain = Certificate::chain_from_pem(&fullchain).unwrap();
    assert_eq!(chain.len(), 2);
    validate_chain(&chain).unwrap();
    let root = Certificate::from_pem(
        &pki.export_artifact(ArtifactScope::Ca, "prod", ArtifactKind::Certificate)
            .unwrap(),
    )
    .unwrap();
    validate_certificate(&chain[0], &root).unwrap();
    let leaf_days = (chain[0].not_after() - Utc::now()).num_days();
    assert!((364..=365).contains(&leaf_days), "leaf valid for {leaf_days} days");

    let counter = dir.path().join("ca/prod/root_ca.srl");
    let before = std::fs::read_to_string(&counter).unwrap();
    let err = pki
        .sign_certificate(&sign("web.acme.local", "prod", "wrong", 365))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(!err.to_string().contains("wrong"));
    assert!(!certs_dir.join("web.acme.local.crt").exists());
    assert!(!certs_dir.join("web.acme.local.key").exists());
    assert_eq!(std::fs::read_to_string(&counter).unwrap(), before);
}

#[test]
fn test_ca_key_is_never_stored_in_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());
    create(&pki, "prod", "Prod Root", "pw1", 30);

    let key = std::fs::read_to_string(dir.path().join("ca/prod/root_ca.key")).unwrap();
    assert!(!key.contains("BEGIN PRIVATE KEY"));
    assert!(!key.contains("pw1"));
}

#[test]
fn test_list_json_shape() {
    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());
    create(&pki, "default", "rootly network", "pw1", 30);
    pki.sign_certificate(&sign("web", "default", "pw1", 10)).unwrap();

    let cas = serde_json::to_value(pki.list_cas().unwrap()).unwrap();
    assert_eq!(cas[0]["id"], "default");
    assert_eq!(cas[0]["subjectDN"]["commonName"], "rootly network");
    assert!(cas[0]["notAfter"].is_string());

    let certs = serde_json::to_value(pki.list_certificates().unwrap()).unwrap();
    assert_eq!(certs[0]["hostname"], "web");
    assert_eq!(certs[0]["keyExists"], true);
    assert_eq!(certs[0]["fullchainExists"], true);

    let status = serde_json::to_value(pki.ca_status()).unwrap();
    assert_eq!(status["keyExists"], true);
    assert_eq!(status["certExists"], true);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_signing_yields_distinct_serials() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 3;

    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());
    create(&pki, "prod", "Prod Root", "pw1", 365);

    let serials: Vec<String> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pki = &pki;
                s.spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| {
                            let host = format!("host-{t}-{i}.acme.local");
                            pki.sign_certificate(&sign(&host, "prod", "pw1", 30))
                                .unwrap()
                                .serial
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let unique: HashSet<_> = serials.iter().collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);
    let mut values: Vec<u64> = serials
        .iter()
        .map(|s| u64::from_str_radix(s, 16).unwrap())
        .collect();
    values.sort_unstable();
    assert_eq!(values, (1..=(THREADS * PER_THREAD) as u64).collect::<Vec<_>>());
}

#[test]
fn test_separate_engines_share_serial_counter() {
    const PER_ENGINE: usize = 10;

    let dir = tempfile::tempdir().unwrap();
    create(&pki(dir.path()), "prod", "Prod Root", "pw1", 365);
    // each engine stands in for a separate `rootly` process
    let engines = [pki(dir.path()), pki(dir.path())];

    let serials: Vec<String> = std::thread::scope(|s| {
        let handles: Vec<_> = engines
            .iter()
            .enumerate()
            .map(|(e, engine)| {
                s.spawn(move || {
                    (0..PER_ENGINE)
                        .map(|i| {
                            let host = format!("engine-{e}-{i}.acme.local");
                            engine
                                .sign_certificate(&sign(&host, "prod", "pw1", 30))
                                .unwrap()
                                .serial
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let unique: HashSet<_> = serials.iter().collect();
    assert_eq!(unique.len(), 2 * PER_ENGINE);

    let index: serde_json::Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("ca").join("prod").join("issued_serials.json")).unwrap(),
    )
    .unwrap();
    let entries = index["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2 * PER_ENGINE);
    assert!(entries.iter().all(|e| e["state"] == "committed"));
}

#[test]
fn test_different_cas_sign_independently() {
    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());
    create(&pki, "a", "Root A", "pw-a", 365);
    create(&pki, "b", "Root B", "pw-b", 365);

    std::thread::scope(|s| {
        s.spawn(|| pki.sign_certificate(&sign("a1", "a", "pw-a", 30)).unwrap());
        s.spawn(|| pki.sign_certificate(&sign("b1", "b", "pw-b", 30)).unwrap());
    });
    // each CA has its own counter
    assert_eq!(pki.sign_certificate(&sign("a2", "a", "pw-a", 30)).unwrap().serial, "02");
    assert_eq!(pki.sign_certificate(&sign("b2", "b", "pw-b", 30)).unwrap().serial, "02");
    assert_eq!(
        pki.sign_certificate(&sign("x", "b", "pw-a", 30)).unwrap_err().kind(),
        ErrorKind::Auth
    );
}

#[test]
fn test_listing_never_sees_half_created_ca() {
    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..10 {
                create(&pki, &format!("ca-{i}"), &format!("Root {i}"), "pw1", 30);
            }
            done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                for info in pki.list_cas().unwrap() {
                    let status = pki.ca_status_for(info.id.as_str()).unwrap();
                    assert!(status.exists, "listed CA {} without its files", info.id);
                }
            }
        });
    });
    assert_eq!(pki.list_cas().unwrap().len(), 10);
}

// ============================================================================
// Upload and export
// ============================================================================

#[test]
fn test_upload_rejects_mismatched_key() {
    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());
    create(&pki, "default", "rootly network", "pw1", 30);
    pki.sign_certificate(&sign("one", "default", "pw1", 10)).unwrap();
    pki.sign_certificate(&sign("two", "default", "pw1", 10)).unwrap();

    let cert = pki.export_artifact(ArtifactScope::Cert, "one", ArtifactKind::Certificate).unwrap();
    let key = pki.export_artifact(ArtifactScope::Cert, "two", ArtifactKind::Key).unwrap();
    let request = UploadRequest::new(ArtifactScope::Cert)
        .with_file("three.crt", cert)
        .with_file("three.key", key);
    let report = pki.upload(&request).unwrap();

    assert!(report.accepted.is_empty());
    assert_eq!(report.rejected.len(), 2);
    assert!(!dir.path().join("certs/three.crt").exists());
    assert!(!dir.path().join("certs/three.key").exists());
}

#[test]
fn test_uploaded_ca_can_sign() {
    let source = tempfile::tempdir().unwrap();
    let origin = pki(source.path());
    create(&origin, "prod", "Prod Root", "pw1", 365);
    let cert = origin.export_artifact(ArtifactScope::Ca, "prod", ArtifactKind::Certificate).unwrap();
    let key = origin.export_artifact(ArtifactScope::Ca, "prod", ArtifactKind::Key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let pki = pki(dir.path());
    let request = UploadRequest::new(ArtifactScope::Ca)
        .with_ca(CaId::new("imported").unwrap())
        .with_passphrase(rootly_pki::Passphrase::new("pw1").unwrap())
        .with_file("root_ca.crt", cert)
        .with_file("root_ca.key", key);
    let report = pki.upload(&request).unwrap();
    assert!(report.is_clean(), "{report:?}");

    let signed = pki.sign_certificate(&sign("web", "imported", "pw1", 30)).unwrap();
    assert_eq!(signed.serial, "01");
}
