//! IST transfer over TLS with a generated certificate authority.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509, X509NameBuilder};
use tempfile::TempDir;
use uuid::Uuid;

use ist::{
    ActionKind, ApplyError, AsyncSenderMap, CacheBuffer, EventHandler, InMemoryWriteSetCache,
    IstConfig, IstError, Receiver, SeqNo, TlsOptions, WriteSetAction,
};

const VERSION: u8 = 10;

/// Install an env-filtered subscriber so `RUST_LOG=ist=debug` surfaces the
/// session logs in test output. Safe to call from every test; only the
/// first call wins.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A certificate authority plus one node certificate signed by it, the way
/// a cluster shares one trust anchor.
struct Ca {
    dir: TempDir,
}

impl Ca {
    fn new() -> Ca {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = pkey();
        let ca_name = name("ist test ca");
        let ca_cert = {
            let mut builder = X509::builder().unwrap();
            builder.set_version(2).unwrap();
            builder.set_pubkey(&ca_key).unwrap();
            builder.set_issuer_name(&ca_name).unwrap();
            builder.set_subject_name(&ca_name).unwrap();
            builder
                .set_not_before(&Asn1Time::days_from_now(0).unwrap())
                .unwrap();
            builder
                .set_not_after(&Asn1Time::days_from_now(365).unwrap())
                .unwrap();
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
            builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
            builder.build()
        };

        let node_key = pkey();
        let node_cert = {
            let mut builder = X509::builder().unwrap();
            builder.set_version(2).unwrap();
            builder.set_pubkey(&node_key).unwrap();
            builder.set_issuer_name(ca_cert.subject_name()).unwrap();
            builder.set_subject_name(&name("ist test node")).unwrap();
            builder
                .set_not_before(&Asn1Time::days_from_now(0).unwrap())
                .unwrap();
            builder
                .set_not_after(&Asn1Time::days_from_now(365).unwrap())
                .unwrap();
            builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
            builder.build()
        };

        std::fs::write(dir.path().join("ca.crt"), ca_cert.to_pem().unwrap()).unwrap();
        std::fs::write(dir.path().join("node.crt"), node_cert.to_pem().unwrap()).unwrap();
        std::fs::write(
            dir.path().join("node.key"),
            node_key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap();

        Ca { dir }
    }

    fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            key: self.path("node.key"),
            cert: self.path("node.crt"),
            ca: Some(self.path("ca.crt")),
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }
}

fn pkey() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn name(common_name: &str) -> openssl::x509::X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    builder.build()
}

#[derive(Clone, Default)]
struct CountingHandler {
    state: Arc<Mutex<(Vec<SeqNo>, Vec<bool>)>>,
}

impl EventHandler for CountingHandler {
    type Trx = SeqNo;

    fn unserialize(
        &mut self,
        action: &WriteSetAction,
        _keep_keys: bool,
    ) -> Result<Self::Trx, ApplyError> {
        Ok(action.seqno_g)
    }

    fn ist_trx(
        &mut self,
        trx: Self::Trx,
        _must_apply: bool,
        _preload: bool,
    ) -> Result<(), ApplyError> {
        self.state.lock().unwrap().0.push(trx);
        Ok(())
    }

    fn ist_cc(
        &mut self,
        _action: WriteSetAction,
        _must_apply: bool,
        _preload: bool,
    ) -> Result<(), ApplyError> {
        Ok(())
    }

    fn ist_end(&mut self, outcome: Result<(), &IstError>) {
        self.state.lock().unwrap().1.push(outcome.is_ok());
    }
}

#[test]
fn tls_is_implied_by_configuration_and_streams_end_to_end() {
    init_tracing();
    let ca = Ca::new();

    // No scheme on the address: TLS presence selects ssl://.
    let config = IstConfig {
        recv_addr: Some("127.0.0.1:0".into()),
        tls: Some(ca.tls_options()),
        ..IstConfig::default()
    };

    let cache = Arc::new(InMemoryWriteSetCache::new());
    for seqno in 5..=9 {
        cache.insert(CacheBuffer {
            seqno_g: SeqNo::new(seqno),
            kind: ActionKind::WriteSet,
            data: Bytes::from(seqno.to_be_bytes().to_vec()),
        });
    }

    let handler = CountingHandler::default();
    let state = Arc::clone(&handler.state);

    let mut receiver = Receiver::new(config.clone(), Arc::clone(&cache), handler);
    let addr = receiver
        .prepare(SeqNo::new(5), SeqNo::new(9), VERSION, Uuid::new_v4())
        .unwrap();
    assert!(addr.starts_with("ssl://"), "advertised address: {addr}");

    let map = AsyncSenderMap::new(config, cache);
    map.run(&addr, SeqNo::new(5), SeqNo::new(9), SeqNo::new(0), VERSION)
        .unwrap();
    receiver.ready(SeqNo::new(5));

    let deadline = Instant::now() + Duration::from_secs(20);
    while state.lock().unwrap().1.is_empty() {
        assert!(Instant::now() < deadline, "TLS session never ended");
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(receiver.finished(), SeqNo::new(9));
    let state = state.lock().unwrap();
    assert_eq!(state.1, vec![true]);
    let seqnos: Vec<i64> = state.0.iter().map(|s| s.get()).collect();
    assert_eq!(seqnos, vec![5, 6, 7, 8, 9]);

    map.cancel();
}

#[test]
fn untrusted_sender_is_rejected_by_the_listener() {
    init_tracing();
    let ca = Ca::new();
    let rogue = Ca::new();

    let config = IstConfig {
        recv_addr: Some("127.0.0.1:0".into()),
        tls: Some(ca.tls_options()),
        ..IstConfig::default()
    };

    let cache = Arc::new(InMemoryWriteSetCache::new());
    let handler = CountingHandler::default();
    let state = Arc::clone(&handler.state);

    let mut receiver = Receiver::new(config, Arc::clone(&cache), handler);
    let addr = receiver
        .prepare(SeqNo::new(5), SeqNo::new(9), VERSION, Uuid::new_v4())
        .unwrap();

    // A donor with a certificate from a different authority. Its TLS
    // handshake fails and the receive thread terminates with the error.
    let rogue_config = IstConfig {
        tls: Some(rogue.tls_options()),
        ..IstConfig::default()
    };
    let result = ist::Sender::connect(&rogue_config, Arc::clone(&cache), &addr, VERSION);
    assert!(result.is_err() || {
        // The client side may only notice at the first read.
        let mut sender = result.unwrap();
        sender
            .send(SeqNo::new(5), SeqNo::new(9), SeqNo::new(0))
            .is_err()
    });

    let deadline = Instant::now() + Duration::from_secs(20);
    while state.lock().unwrap().1.is_empty() {
        assert!(Instant::now() < deadline, "receiver never terminated");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(state.lock().unwrap().1, vec![false]);
    assert!(state.lock().unwrap().0.is_empty());

    receiver.finished();
    assert!(matches!(receiver.take_error(), Some(IstError::Tls(_))));
}
