//! TLS Transport (spec §4.9): `ByteBuffer`-shaped streams wrapping a
//! `rustls` connection over a raw, non-blocking socket fd.
//!
//! The state machine mirrors [`crate::buffer::ByteBuffer`] almost exactly —
//! the same three-cell read/drain/wait-closed discipline, the same
//! persistent-subscription-plus-weak-backreference arming — with the
//! plaintext queues sitting on the far side of a `rustls::Connection` rather
//! than directly on the fd. Driving `rustls` from a reactor's readiness
//! events instead of `async`/`await` is the same non-blocking pump loop mio
//! users have written by hand since mio dropped TLS support: feed ciphertext
//! in with `read_tls`, hand it to `process_new_packets`, drain whatever
//! plaintext fell out, then feed ciphertext back out with `write_tls`.
//! Handshake messages flow through exactly the same pump; nothing here
//! special-cases the handshake beyond waiting for `is_handshaking()` to
//! clear before resolving `connect`/`accept`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use socket2::Socket;

use crate::buffer::{scan_eol, EolStyle};
use crate::continuation::{Continuation, Settle};
use crate::deadline::DeadlineId;
use crate::error::{Error, ErrorKind};
use crate::interest::Interest;
use crate::net::address::Address;
use crate::net::stream::{connect_raw, Listener};
use crate::reactor::Reactor;
use crate::readiness::ReadinessEvent;

/// Which side of the handshake a [`TlsConfig`] is building for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    Client,
    Server,
}

/// Protocol version floor/ceiling, per spec §4.9. Only `Tls1_2` and
/// `Tls1_3` actually build — see the note on [`TlsConfig::build`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TlsVersion {
    Tls1,
    Tls1_1,
    Tls1_2,
    Tls1_3,
    Ssl3,
}

fn version_rank(v: TlsVersion) -> Option<u8> {
    match v {
        TlsVersion::Tls1_2 => Some(0),
        TlsVersion::Tls1_3 => Some(1),
        _ => None,
    }
}

/// Builder for a client or server TLS context (spec §4.9).
///
/// `min_version`/`max_version` default to TLS1.2..=TLS1.3, the only
/// versions this build of `rustls` (`features = ["tls12"]`) speaks.
/// Asking for `Tls1`, `Tls1_1`, or `Ssl3` fails `build()` with
/// `InvalidArgument` rather than silently widening the range — see
/// DESIGN.md for why those are out of reach here.
pub struct TlsConfig {
    role: Role,
    min_version: TlsVersion,
    max_version: TlsVersion,
    ca_path: Option<PathBuf>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    insecure: bool,
}

impl TlsConfig {
    pub fn new(role: Role) -> TlsConfig {
        TlsConfig {
            role,
            min_version: TlsVersion::Tls1_2,
            max_version: TlsVersion::Tls1_3,
            ca_path: None,
            cert_path: None,
            key_path: None,
            insecure: false,
        }
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.max_version = version;
        self
    }

    /// PEM file of trust anchors, used by clients to verify the peer's
    /// certificate chain. Ignored (and unnecessary) when `insecure(true)`.
    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// PEM certificate chain; required for `Role::Server`.
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    /// PEM private key matching `cert_path`; required for `Role::Server`.
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Disables peer certificate verification entirely. For test fixtures
    /// and loopback transports only.
    pub fn insecure(mut self, yes: bool) -> Self {
        self.insecure = yes;
        self
    }

    /// Validates the configuration (version range, path presence,
    /// cert/key consistency) and parses the PEM material into a reusable
    /// [`TlsContext`].
    pub fn build(self) -> Result<TlsContext, Error> {
        let min_rank = version_rank(self.min_version)
            .ok_or_else(|| Error::invalid_argument(format!("{:?} is not supported (only Tls1_2/Tls1_3)", self.min_version)))?;
        let max_rank = version_rank(self.max_version)
            .ok_or_else(|| Error::invalid_argument(format!("{:?} is not supported (only Tls1_2/Tls1_3)", self.max_version)))?;
        if min_rank > max_rank {
            return Err(Error::invalid_argument("min_version is newer than max_version"));
        }
        let mut versions: Vec<&'static rustls::SupportedProtocolVersion> = Vec::new();
        if min_rank <= 0 && max_rank >= 0 {
            versions.push(&rustls::version::TLS12);
        }
        if min_rank <= 1 && max_rank >= 1 {
            versions.push(&rustls::version::TLS13);
        }

        match self.role {
            Role::Server => {
                let cert_path = self.cert_path.as_ref().ok_or_else(|| Error::invalid_argument("server role requires cert_path"))?;
                let key_path = self.key_path.as_ref().ok_or_else(|| Error::invalid_argument("server role requires key_path"))?;
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                let config = rustls::ServerConfig::builder_with_protocol_versions(&versions)
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| Error::new(ErrorKind::Ssl, e.to_string()))?;
                Ok(TlsContext {
                    inner: Arc::new(ConfigInner::Server(Arc::new(config))),
                })
            }
            Role::Client => {
                let builder = rustls::ClientConfig::builder_with_protocol_versions(&versions);
                let config = if self.insecure {
                    builder
                        .dangerous()
                        .with_custom_certificate_verifier(Arc::new(NoVerification))
                        .with_no_client_auth()
                } else {
                    let ca_path = self.ca_path.as_ref().ok_or_else(|| Error::invalid_argument("client role requires ca_path unless insecure(true)"))?;
                    let mut roots = rustls::RootCertStore::empty();
                    for cert in load_certs(ca_path)? {
                        roots.add(cert).map_err(|e| Error::new(ErrorKind::Ssl, e.to_string()))?;
                    }
                    builder.with_root_certificates(roots).with_no_client_auth()
                };
                Ok(TlsContext {
                    inner: Arc::new(ConfigInner::Client(Arc::new(config))),
                })
            }
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(Error::from)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::new(ErrorKind::Ssl, format!("reading {}: {}", path.display(), e)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(Error::from)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::new(ErrorKind::Ssl, format!("reading {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::invalid_argument(format!("no private key found in {}", path.display())))
}

/// Accepts any server certificate. Only reachable via [`TlsConfig::insecure`].
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

enum ConfigInner {
    Client(Arc<rustls::ClientConfig>),
    Server(Arc<rustls::ServerConfig>),
}

/// A built, reusable TLS configuration. Cheap to clone; every `connect`/
/// `accept` call builds a fresh `rustls::Connection` from the same config.
#[derive(Clone)]
pub struct TlsContext {
    inner: Arc<ConfigInner>,
}

enum Conn {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

impl Conn {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Conn::Client(c) => c.read_tls(rd),
            Conn::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Conn::Client(c) => c.write_tls(wr),
            Conn::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Conn::Client(c) => c.process_new_packets(),
            Conn::Server(c) => c.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_write(),
            Conn::Server(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Conn::Client(c) => c.is_handshaking(),
            Conn::Server(c) => c.is_handshaking(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Conn::Client(c) => c.writer(),
            Conn::Server(c) => c.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Conn::Client(c) => c.reader(),
            Conn::Server(c) => c.reader(),
        }
    }
}

struct RawFdIo(RawFd);

impl Read for RawFdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        raw_op(|| unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
    }
}

impl Write for RawFdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        raw_op(|| unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn raw_op(mut f: impl FnMut() -> isize) -> io::Result<usize> {
    loop {
        let n = f();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

enum ReadKind {
    Read { max: usize },
    ReadExactly { n: usize },
    Peek { n: usize },
    ReadLine { style: EolStyle },
}

struct ReadOp {
    kind: ReadKind,
    settle: Settle<Vec<u8>, Error>,
    deadline: Option<DeadlineId>,
}

struct DrainOp {
    settle: Settle<(), Error>,
    deadline: Option<DeadlineId>,
}

struct Inner {
    reactor: Reactor,
    fd: Option<OwnedFd>,
    event: ReadinessEvent,
    conn: Conn,
    local: Address,
    remote: Address,
    plaintext_in: VecDeque<u8>,
    plaintext_out: VecDeque<u8>,
    eof: bool,
    io_error: Option<Error>,
    closed: bool,
    read_disabled: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_op: Option<ReadOp>,
    drain_op: Option<DrainOp>,
    wait_closed_op: Option<Settle<(), Error>>,
    handshake_op: Option<Settle<(), Error>>,
}

const INPUT_CAP: usize = 1024 * 1024;
const CHUNK: usize = 64 * 1024;

/// A connected, encrypted duplex stream. Same read/write/drain/close
/// surface as [`crate::buffer::ByteBuffer`]; the handshake has already
/// completed by the time `connect`/`accept` resolves one of these.
#[derive(Clone)]
pub struct TlsBuffer {
    inner: Rc<RefCell<Inner>>,
}

impl TlsBuffer {
    fn new(reactor: &Reactor, socket: Socket, local: Address, remote: Address, conn: Conn) -> Result<TlsBuffer, Error> {
        let fd = socket.into_raw_fd();
        let event = ReadinessEvent::new(reactor, fd)?;
        let inner = Rc::new(RefCell::new(Inner {
            reactor: reactor.clone(),
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
            event,
            conn,
            local,
            remote,
            plaintext_in: VecDeque::new(),
            plaintext_out: VecDeque::new(),
            eof: false,
            io_error: None,
            closed: false,
            read_disabled: false,
            read_timeout: None,
            write_timeout: None,
            read_op: None,
            drain_op: None,
            wait_closed_op: None,
            handshake_op: None,
        }));
        let buffer = TlsBuffer { inner };
        buffer.arm();
        Ok(buffer)
    }

    fn arm(&self) {
        let event = self.inner.borrow().event.clone();
        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        event.on_persist(
            Interest::READ | Interest::WRITE,
            move |bits| match weak.upgrade() {
                Some(inner) => TlsBuffer { inner }.handle_ready(bits),
                None => false,
            },
            None,
        );
    }

    /// Drives the handshake to completion, settling once `rustls` reports
    /// the connection is no longer handshaking (or has failed).
    fn await_handshake(&self) -> Continuation<TlsBuffer, Error> {
        {
            let mut inner = self.inner.borrow_mut();
            pump(&mut inner);
        }
        if let Some(result) = self.handshake_outcome() {
            return match result {
                Ok(()) => Continuation::resolve(self.clone()),
                Err(e) => Continuation::reject(e),
            };
        }
        let (cont, settle) = Continuation::new_pending();
        self.inner.borrow_mut().handshake_op = Some(settle);
        let this = self.clone();
        cont.then_or_else(move |_| Continuation::resolve(this.clone()), |e| Continuation::reject(e))
    }

    fn handshake_outcome(&self) -> Option<Result<(), Error>> {
        let inner = self.inner.borrow();
        if let Some(err) = inner.io_error.clone() {
            return Some(Err(err));
        }
        if inner.eof {
            return Some(Err(Error::eof()));
        }
        if !inner.conn.is_handshaking() {
            return Some(Ok(()));
        }
        None
    }

    fn settle_handshake(&self) {
        let outcome = self.handshake_outcome();
        if let Some(result) = outcome {
            let op = self.inner.borrow_mut().handshake_op.take();
            if let Some(settle) = op {
                match result {
                    Ok(()) => settle.fulfill(()),
                    Err(e) => settle.reject(e),
                }
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().event.fd()
    }

    pub fn local_address(&self) -> Address {
        self.inner.borrow().local.clone()
    }

    pub fn remote_address(&self) -> Address {
        self.inner.borrow().remote.clone()
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().plaintext_out.len()
    }

    pub fn available(&self) -> usize {
        self.inner.borrow().plaintext_in.len()
    }

    pub fn set_timeout(&self, read: Option<Duration>, write: Option<Duration>) {
        let mut inner = self.inner.borrow_mut();
        inner.read_timeout = read;
        inner.write_timeout = write;
    }

    fn handle_ready(&self, bits: Interest) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return false;
            }
            pump(&mut inner);
            let _ = bits;
        }
        self.settle_handshake();
        self.settle_read();
        self.settle_drain();
        self.settle_wait_closed();
        true
    }

    /// Reads up to the internal chunk cap (at least 1, unless EOF/closed).
    /// The no-arg counterpart to [`Self::read_n`]; spec §4.5 lists `read()`
    /// and `read(n)` as two distinct operations rather than one with a
    /// default argument.
    pub fn read(&self) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::Read { max: CHUNK })
    }

    pub fn read_n(&self, max: usize) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::Read { max })
    }

    pub fn read_exactly(&self, n: usize) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::ReadExactly { n })
    }

    pub fn peek(&self, n: usize) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::Peek { n })
    }

    pub fn read_line(&self, style: EolStyle) -> Continuation<Vec<u8>, Error> {
        self.start_read(ReadKind::ReadLine { style })
    }

    fn start_read(&self, kind: ReadKind) -> Continuation<Vec<u8>, Error> {
        {
            let inner = self.inner.borrow();
            if inner.read_op.is_some() {
                return Continuation::reject(Error::busy());
            }
            if let Some(err) = inner.io_error.clone() {
                return Continuation::reject(err);
            }
            if inner.closed {
                return Continuation::reject(Error::eof());
            }
        }
        self.reenable_read_if_needed();
        if let Some(value) = self.try_fulfill_read(&kind) {
            return Continuation::resolve(value);
        }
        {
            let inner = self.inner.borrow();
            if inner.eof || inner.closed {
                return Continuation::reject(Error::eof());
            }
            if let Some(err) = inner.io_error.clone() {
                return Continuation::reject(err);
            }
        }
        let (cont, settle) = Continuation::new_pending();
        let timeout = self.inner.borrow().read_timeout;
        let deadline = timeout.map(|d| {
            let this = self.clone();
            self.inner.borrow().reactor.schedule_deadline(d, Box::new(move || this.timeout_read()))
        });
        self.inner.borrow_mut().read_op = Some(ReadOp { kind, settle, deadline });
        cont
    }

    fn reenable_read_if_needed(&self) {
        let was_disabled = {
            let mut inner = self.inner.borrow_mut();
            let was = inner.read_disabled;
            inner.read_disabled = false;
            was
        };
        if was_disabled {
            let _ = self.inner.borrow().event.set_interest(Interest::READ | Interest::WRITE);
        }
    }

    fn try_fulfill_read(&self, kind: &ReadKind) -> Option<Vec<u8>> {
        let mut inner = self.inner.borrow_mut();
        match *kind {
            ReadKind::Read { max } => {
                if inner.plaintext_in.is_empty() {
                    return None;
                }
                let n = max.min(inner.plaintext_in.len());
                Some(inner.plaintext_in.drain(..n).collect())
            }
            ReadKind::ReadExactly { n } => {
                if inner.plaintext_in.len() < n {
                    return None;
                }
                Some(inner.plaintext_in.drain(..n).collect())
            }
            ReadKind::Peek { n } => {
                if inner.plaintext_in.len() < n {
                    return None;
                }
                Some(inner.plaintext_in.iter().take(n).copied().collect())
            }
            ReadKind::ReadLine { style } => match scan_eol(&inner.plaintext_in, style) {
                Some((len, delim)) => {
                    let line: Vec<u8> = inner.plaintext_in.drain(..len).collect();
                    inner.plaintext_in.drain(..delim);
                    Some(line)
                }
                None => None,
            },
        }
    }

    fn settle_read(&self) {
        match self.try_fulfill_read_pending() {
            Some(Ok(bytes)) => self.complete_read(Ok(bytes)),
            Some(Err(e)) => self.complete_read(Err(e)),
            None => self.apply_backpressure(),
        }
    }

    fn try_fulfill_read_pending(&self) -> Option<Result<Vec<u8>, Error>> {
        let kind_snapshot = {
            let inner = self.inner.borrow();
            match &inner.read_op {
                None => return None,
                Some(op) => match &op.kind {
                    ReadKind::Read { max } => ReadKind::Read { max: *max },
                    ReadKind::ReadExactly { n } => ReadKind::ReadExactly { n: *n },
                    ReadKind::Peek { n } => ReadKind::Peek { n: *n },
                    ReadKind::ReadLine { style } => ReadKind::ReadLine { style: *style },
                },
            }
        };
        if let Some(bytes) = self.try_fulfill_read(&kind_snapshot) {
            return Some(Ok(bytes));
        }
        let inner = self.inner.borrow();
        if let Some(err) = inner.io_error.clone() {
            return Some(Err(err));
        }
        if inner.eof {
            return Some(Err(Error::eof()));
        }
        None
    }

    fn complete_read(&self, result: Result<Vec<u8>, Error>) {
        let op = self.inner.borrow_mut().read_op.take();
        if let Some(op) = op {
            if let Some(id) = op.deadline {
                self.inner.borrow().reactor.cancel_deadline(id);
            }
            op.settle.settle_result(result);
        }
    }

    fn timeout_read(&self) {
        if self.inner.borrow().read_op.is_some() {
            self.complete_read(Err(Error::timeout()));
        }
    }

    fn apply_backpressure(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.read_op.is_none() && !inner.read_disabled && inner.plaintext_in.len() >= INPUT_CAP {
            inner.read_disabled = true;
            drop(inner);
            let _ = self.inner.borrow().event.set_interest(Interest::WRITE);
        }
    }

    pub fn write(&self, bytes: &[u8]) -> Continuation<(), Error> {
        match self.submit(bytes) {
            Ok(()) => self.drain(),
            Err(e) => Continuation::reject(e),
        }
    }

    pub fn submit(&self, bytes: &[u8]) -> Result<(), Error> {
        {
            let inner = self.inner.borrow();
            if inner.closed {
                return Err(Error::eof());
            }
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.plaintext_out.extend(bytes.iter().copied());
            pump(&mut inner);
        }
        self.settle_drain();
        Ok(())
    }

    pub fn write_line(&self, line: &[u8], style: EolStyle) -> Result<(), Error> {
        self.submit(line)?;
        self.submit(style.delimiter())
    }

    pub fn drain(&self) -> Continuation<(), Error> {
        {
            let inner = self.inner.borrow();
            if inner.drain_op.is_some() {
                return Continuation::reject(Error::busy());
            }
            if let Some(err) = inner.io_error.clone() {
                return Continuation::reject(err);
            }
            if inner.closed {
                return Continuation::reject(Error::eof());
            }
            if inner.plaintext_out.is_empty() {
                return Continuation::resolve(());
            }
        }
        let (cont, settle) = Continuation::new_pending();
        let timeout = self.inner.borrow().write_timeout;
        let deadline = timeout.map(|d| {
            let this = self.clone();
            self.inner.borrow().reactor.schedule_deadline(d, Box::new(move || this.timeout_drain()))
        });
        self.inner.borrow_mut().drain_op = Some(DrainOp { settle, deadline });
        cont
    }

    fn settle_drain(&self) {
        let done = {
            let inner = self.inner.borrow();
            if inner.drain_op.is_none() {
                return;
            }
            if let Some(err) = inner.io_error.clone() {
                Some(Err(err))
            } else if inner.eof {
                Some(Err(Error::eof()))
            } else if inner.plaintext_out.is_empty() {
                Some(Ok(()))
            } else {
                None
            }
        };
        if let Some(result) = done {
            let op = self.inner.borrow_mut().drain_op.take();
            if let Some(op) = op {
                if let Some(id) = op.deadline {
                    self.inner.borrow().reactor.cancel_deadline(id);
                }
                op.settle.settle_result(result);
            }
        }
    }

    fn timeout_drain(&self) {
        if self.inner.borrow().drain_op.is_some() {
            let op = self.inner.borrow_mut().drain_op.take();
            if let Some(op) = op {
                op.settle.reject(Error::timeout());
            }
        }
    }

    pub fn wait_closed(&self) -> Continuation<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.wait_closed_op.is_some() {
            return Continuation::reject(Error::busy());
        }
        if inner.closed {
            return Continuation::reject(Error::eof());
        }
        let (cont, settle) = Continuation::new_pending();
        inner.wait_closed_op = Some(settle);
        cont
    }

    fn settle_wait_closed(&self) {
        let (fulfill, reject) = {
            let inner = self.inner.borrow();
            if inner.wait_closed_op.is_none() {
                return;
            }
            if inner.eof {
                (true, None)
            } else if let Some(err) = inner.io_error.clone() {
                (false, Some(err))
            } else {
                return;
            }
        };
        let op = self.inner.borrow_mut().wait_closed_op.take();
        if let Some(settle) = op {
            if fulfill {
                settle.fulfill(());
            } else if let Some(err) = reject {
                settle.reject(err);
            }
        }
    }

    pub fn close(&self) -> Result<(), Error> {
        let fd = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Error::eof());
            }
            inner.closed = true;
            inner.fd.take()
        };
        self.inner.borrow().event.cancel();
        self.complete_read(Err(Error::eof()));
        let op = self.inner.borrow_mut().drain_op.take();
        if let Some(op) = op {
            if let Some(id) = op.deadline {
                self.inner.borrow().reactor.cancel_deadline(id);
            }
            op.settle.reject(Error::eof());
        }
        let waiter = self.inner.borrow_mut().wait_closed_op.take();
        if let Some(settle) = waiter {
            settle.fulfill(());
        }
        drop(fd);
        Ok(())
    }
}

/// Pumps ciphertext in both directions and moves any newly decrypted
/// plaintext into `plaintext_in`. Mirrors `buffer::pump_read`/`pump_write`,
/// just with a `rustls::Connection` sitting between the queues and the fd.
fn pump(inner: &mut Inner) {
    if inner.io_error.is_some() || inner.closed {
        return;
    }
    let fd = match &inner.fd {
        Some(fd) => fd.as_raw_fd(),
        None => return,
    };
    let mut io = RawFdIo(fd);

    if !inner.plaintext_out.is_empty() {
        let chunk: Vec<u8> = inner.plaintext_out.iter().copied().collect();
        match inner.conn.writer().write_all(&chunk) {
            Ok(()) => inner.plaintext_out.clear(),
            Err(e) => {
                inner.io_error = Some(Error::new(ErrorKind::Ssl, e.to_string()));
                return;
            }
        }
    }

    loop {
        match inner.conn.read_tls(&mut io) {
            Ok(0) => {
                inner.eof = true;
                break;
            }
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                inner.io_error = Some(e.into());
                break;
            }
        }
    }

    if inner.io_error.is_none() {
        match inner.conn.process_new_packets() {
            Ok(state) => {
                let n = state.plaintext_bytes_to_read();
                if n > 0 {
                    let mut buf = vec![0u8; n];
                    match inner.conn.reader().read_exact(&mut buf) {
                        Ok(()) => inner.plaintext_in.extend(buf),
                        Err(e) => inner.io_error = Some(Error::new(ErrorKind::Ssl, e.to_string())),
                    }
                }
            }
            Err(e) => inner.io_error = Some(Error::new(ErrorKind::Ssl, e.to_string())),
        }
    }

    if inner.io_error.is_none() {
        while inner.conn.wants_write() {
            match inner.conn.write_tls(&mut io) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    inner.io_error = Some(e.into());
                    break;
                }
            }
        }
    }
}

/// Connects to `host:port`, resolving via the reactor's DNS handle, then
/// runs a client handshake over the raw fd (the hook
/// [`crate::net::stream::connect_raw`] exists for).
pub fn connect(reactor: &Reactor, host: &str, port: u16, ctx: TlsContext) -> Continuation<TlsBuffer, Error> {
    let reactor2 = reactor.clone();
    let host_owned = host.to_string();
    reactor.dns_handle().lookup_ip(reactor, host).then(move |addrs| match addrs.into_iter().next() {
        Some(ip) => connect_addr(&reactor2, Address::from_std(std::net::SocketAddr::new(ip, port)), None, ctx, &host_owned),
        None => Continuation::reject(Error::new(ErrorKind::Dns, "no addresses returned")),
    })
}

/// Connects to a pre-resolved address, handshaking with `server_name` used
/// for SNI and, unless `insecure(true)`, hostname verification.
pub fn connect_addr(
    reactor: &Reactor,
    addr: Address,
    timeout: Option<Duration>,
    ctx: TlsContext,
    server_name: &str,
) -> Continuation<TlsBuffer, Error> {
    let server_name = match ServerName::try_from(server_name.to_string()) {
        Ok(n) => n,
        Err(_) => return Continuation::reject(Error::invalid_argument("invalid server name for SNI")),
    };
    let client_config = match &*ctx.inner {
        ConfigInner::Client(c) => c.clone(),
        ConfigInner::Server(_) => return Continuation::reject(Error::invalid_argument("connect requires a client TlsContext")),
    };
    let reactor2 = reactor.clone();
    connect_raw(reactor, addr, timeout).then(move |(socket, local, remote)| {
        let conn = match rustls::ClientConnection::new(client_config, server_name) {
            Ok(c) => c,
            Err(e) => return Continuation::reject(Error::new(ErrorKind::Ssl, e.to_string())),
        };
        match TlsBuffer::new(&reactor2, socket, local, remote, Conn::Client(conn)) {
            Ok(buffer) => buffer.await_handshake(),
            Err(e) => Continuation::reject(e),
        }
    })
}

/// Accepts the next inbound connection on `listener` and runs a server
/// handshake over it (the hook [`crate::net::stream::Listener::accept_raw`]
/// exists for).
pub fn accept(reactor: &Reactor, listener: &Listener, ctx: TlsContext) -> Continuation<TlsBuffer, Error> {
    let server_config = match &*ctx.inner {
        ConfigInner::Server(c) => c.clone(),
        ConfigInner::Client(_) => return Continuation::reject(Error::invalid_argument("accept requires a server TlsContext")),
    };
    let reactor2 = reactor.clone();
    listener.accept_raw().then(move |(socket, local, remote)| {
        let conn = match rustls::ServerConnection::new(server_config) {
            Ok(c) => c,
            Err(e) => return Continuation::reject(Error::new(ErrorKind::Ssl, e.to_string())),
        };
        match TlsBuffer::new(&reactor2, socket, local, remote, Conn::Server(conn)) {
            Ok(buffer) => buffer.await_handshake(),
            Err(e) => Continuation::reject(e),
        }
    })
}
