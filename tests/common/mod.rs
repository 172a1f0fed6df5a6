//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use credstore::resource::ResourceLoader;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;

pub const IDENTITY_STORE_PASSWORD: &str = "storepass";
pub const IDENTITY_KEY_PASSWORD: &str = "keypass";
pub const TRUST_STORE_PASSWORD: &str = "trustpass";

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

pub fn fixture(name: &str) -> Vec<u8> {
    std::fs::read(fixtures_dir().join(name)).unwrap()
}

pub fn fixture_text(name: &str) -> String {
    String::from_utf8(fixture(name)).unwrap()
}

/// Loader resolving fixture names as resources
pub fn fixture_loader() -> ResourceLoader {
    ResourceLoader::new().with_root(fixtures_dir())
}

/// Server side of one test handshake
pub struct TestServer {
    pub port: u16,
    handle: JoinHandle<Option<String>>,
}

impl TestServer {
    /// Client connection to the server
    pub fn tcp(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).unwrap()
    }

    /// Common name of the client certificate, `None` when the handshake
    /// failed or the client sent no certificate
    pub fn client_common_name(self) -> Option<String> {
        self.handle.join().unwrap()
    }
}

/// Accept one TLS connection presenting the `example.com` certificate
///
/// With `request_client_cert` the server asks for a client certificate and
/// accepts whatever it gets.
pub fn spawn_tls_server(request_client_cert: bool) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let cert = X509::from_pem(&fixture("example.pem")).unwrap();
    let key = PKey::private_key_from_pem(&fixture("example.pk8.pem")).unwrap();

    let mut builder = SslContextBuilder::new(SslMethod::tls_server()).unwrap();
    builder.set_certificate(&cert).unwrap();
    builder.set_private_key(&key).unwrap();
    if request_client_cert {
        builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
    }
    let context = builder.build();

    let handle = thread::spawn(move || {
        let (tcp, _) = listener.accept().ok()?;
        let ssl = Ssl::new(&context).ok()?;
        let stream = ssl.accept(tcp).ok()?;

        let peer = stream.ssl().peer_certificate()?;
        let cn = peer.subject_name().entries_by_nid(Nid::COMMONNAME).next()?;
        let cn = cn.data().as_utf8().ok()?.to_string();
        Some(cn)
    });

    TestServer { port, handle }
}
