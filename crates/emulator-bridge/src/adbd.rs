//! ADB daemon wire client
//!
//! Speaks the host protocol directly over TCP to the local adb server.
//!
//! One client is one session: every method takes `&mut self`, so a command
//! can't start before the previous reply was consumed, and at most one
//! transport is bound at a time. The daemon closes the connection after
//! one-shot replies (device list, version, shell output); the client drops
//! the session afterwards and the next command reconnects from scratch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use avd_pilot_core::config::AdbServerConfig;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::adb::{AdbError, ServerControl};
use crate::device::{parse_device_list, parse_device_snapshot, Device};
use crate::protocol::{encode_request, FrameBuffer, FAIL, OKAY};

/// Cap on the reconnect delay
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before the retry after `delay`
fn next_backoff(delay: Duration, factor: f64) -> Duration {
    delay.mul_f64(factor).min(MAX_BACKOFF)
}

static PROP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(?P<key>[^\]]*)\]:\s*\[(?P<value>.*)\]$").expect("valid regex"));

/// An open connection and everything bound to it
struct Session {
    stream: TcpStream,
    buffer: FrameBuffer,
    transport: Option<String>,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            transport: None,
        }
    }

    /// Read more bytes into the buffer; 0 means the daemon closed the connection
    async fn fill(&mut self, cancel: &CancellationToken) -> Result<usize, AdbError> {
        let mut chunk = [0u8; 4096];
        let read = tokio::select! {
            read = self.stream.read(&mut chunk) => read?,
            _ = cancel.cancelled() => return Err(AdbError::Cancelled),
        };

        if read > 0 {
            trace!("RX: {:?}", String::from_utf8_lossy(&chunk[..read]));
            self.buffer.extend(&chunk[..read]);
        }
        Ok(read)
    }

    async fn request(
        &mut self,
        command: &str,
        request: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        tokio::select! {
            written = self.stream.write_all(request) => written?,
            _ = cancel.cancelled() => return Err(AdbError::Cancelled),
        }
        self.stream.flush().await?;

        let status = self.read_status(cancel).await?;
        if status.eq_ignore_ascii_case(OKAY) {
            return Ok(());
        }

        if status.eq_ignore_ascii_case(FAIL) {
            let reason = self
                .read_frame(cancel)
                .await
                .map(|frame| String::from_utf8_lossy(&frame).into_owned())
                .unwrap_or_default();

            return Err(AdbError::CommandRejected {
                command: command.to_string(),
                reason,
            });
        }

        Err(AdbError::Protocol(format!(
            "unexpected status {:?} for '{}'",
            String::from_utf8_lossy(&status),
            command
        )))
    }

    async fn read_status(&mut self, cancel: &CancellationToken) -> Result<[u8; 4], AdbError> {
        loop {
            if let Some(status) = self.buffer.take_status() {
                return Ok(status);
            }
            if self.fill(cancel).await? == 0 {
                return Err(AdbError::ConnectionClosed);
            }
        }
    }

    async fn read_frame(&mut self, cancel: &CancellationToken) -> Result<Bytes, AdbError> {
        loop {
            if cancel.is_cancelled() {
                return Err(AdbError::Cancelled);
            }
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(frame);
            }
            if self.fill(cancel).await? == 0 {
                return Err(AdbError::ConnectionClosed);
            }
        }
    }

    async fn read_to_end(&mut self, cancel: &CancellationToken) -> Result<Bytes, AdbError> {
        while self.fill(cancel).await? > 0 {}
        Ok(self.buffer.take_remaining())
    }
}

/// ADB daemon client
pub struct AdbdClient {
    host: String,
    port: u16,
    backoff_base: Duration,
    backoff_factor: f64,
    restart_after_failures: u32,
    server: Option<Arc<dyn ServerControl>>,
    cancel: CancellationToken,
    session: Option<Session>,
}

impl AdbdClient {
    pub fn new(config: &AdbServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            backoff_base: config.backoff_base(),
            backoff_factor: config.backoff_factor.max(1.0),
            restart_after_failures: config.restart_after_failures,
            server: None,
            cancel: CancellationToken::new(),
            session: None,
        }
    }

    /// Restart the daemon through `server` after repeated connection failures
    pub fn with_server_control(mut self, server: Arc<dyn ServerControl>) -> Self {
        self.server = Some(server);
        self
    }

    /// Stop retries, reads and device watching when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Device the session is currently bound to
    pub fn current_transport(&self) -> Option<&str> {
        self.session.as_ref()?.transport.as_deref()
    }

    /// Connect if not connected, retrying with backoff until cancelled
    pub async fn connect(&mut self) -> Result<(), AdbError> {
        if self.session.is_some() {
            return Ok(());
        }

        let address = self.address();
        let mut delay = self.backoff_base;
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(AdbError::Cancelled);
            }

            if failures > 0 && self.restart_after_failures > 0 && failures % self.restart_after_failures == 0 {
                self.restart_server(failures).await;
            }

            trace!("Connecting: {} (attempt {})", address, failures + 1);
            let attempt = tokio::select! {
                attempt = TcpStream::connect((self.host.as_str(), self.port)) => attempt,
                _ = self.cancel.cancelled() => return Err(AdbError::Cancelled),
            };

            match attempt {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.session = Some(Session::new(stream));
                    debug!("Connected: {}", address);
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    warn!("adb server at {} unreachable (attempt {}): {}", address, failures, e);
                }
            }

            trace!("Not connected, waiting {:?} before retry", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(AdbError::Cancelled),
            }
            delay = next_backoff(delay, self.backoff_factor);
        }
    }

    async fn restart_server(&self, failures: u32) {
        let Some(server) = &self.server else {
            return;
        };

        warn!("adb server unreachable after {} attempts, restarting it", failures);
        if let Err(e) = server.kill_server().await {
            debug!("Stopping adb server failed: {}", e);
        }
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = server.start_server().await {
            warn!("Starting adb server failed: {}", e);
        }
    }

    /// Drop the connection, its transport binding and any buffered bytes
    pub fn disconnect(&mut self) {
        if self.session.take().is_some() {
            trace!("Disconnected from {}", self.address());
        }
    }

    /// Send one request and wait for OKAY. Any failure ends the session.
    async fn send_command(&mut self, command: &str) -> Result<(), AdbError> {
        let request = encode_request(command)?;
        self.connect().await?;

        trace!("TX: {}", command);
        let result = match self.session.as_mut() {
            Some(session) => session.request(command, &request, &self.cancel).await,
            None => Err(AdbError::ConnectionClosed),
        };

        if result.is_err() {
            self.disconnect();
        }
        result
    }

    /// Read the next framed reply, keeping any bytes that belong to later frames
    pub async fn read_next_reply(&mut self) -> Result<String, AdbError> {
        let result = match self.session.as_mut() {
            Some(session) => session.read_frame(&self.cancel).await,
            None => Err(AdbError::ConnectionClosed),
        };

        match result {
            Ok(frame) => Ok(String::from_utf8_lossy(&frame).into_owned()),
            Err(e) => {
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Read an unframed reply until the daemon closes the connection
    async fn read_reply_body(&mut self) -> Result<String, AdbError> {
        let result = match self.session.as_mut() {
            Some(session) => session.read_to_end(&self.cancel).await,
            None => Err(AdbError::ConnectionClosed),
        };
        self.disconnect();

        result.map(|body| String::from_utf8_lossy(&body).into_owned())
    }

    /// `host:version`
    pub async fn host_version(&mut self) -> Result<u32, AdbError> {
        self.send_command("host:version").await?;
        let reply = self.read_next_reply().await;
        self.disconnect();

        let reply = reply?;
        u32::from_str_radix(reply.trim(), 16)
            .map_err(|_| AdbError::Protocol(format!("invalid version reply {:?}", reply)))
    }

    /// Bind the session to `serial`. A no-op when already bound to it.
    pub async fn transport(&mut self, serial: &str) -> Result<(), AdbError> {
        if self
            .current_transport()
            .is_some_and(|current| current.eq_ignore_ascii_case(serial))
        {
            return Ok(());
        }

        self.send_command(&format!("host:transport:{}", serial)).await?;
        if let Some(session) = self.session.as_mut() {
            session.transport = Some(serial.to_string());
        }
        Ok(())
    }

    /// `host:devices-l`, offline devices excluded
    pub async fn list_devices(&mut self) -> Result<Vec<Device>, AdbError> {
        self.send_command("host:devices-l").await?;
        let reply = self.read_next_reply().await;
        self.disconnect();

        Ok(parse_device_list(&reply?))
    }

    /// Subscribe to `host:track-devices-l` and hand every snapshot to `on_event`.
    ///
    /// Each frame is the daemon's full device list at that moment, offline
    /// entries included; an empty snapshot means nothing is attached. Only
    /// returns when cancelled (`Ok`) or when the connection is lost.
    pub async fn watch_devices<F>(&mut self, mut on_event: F) -> Result<(), AdbError>
    where
        F: FnMut(Vec<Device>),
    {
        match self.send_command("host:track-devices-l").await {
            Err(AdbError::Cancelled) => return Ok(()),
            other => other?,
        }
        debug!("Tracking devices on {}", self.address());

        loop {
            match self.read_next_reply().await {
                Ok(body) => on_event(parse_device_snapshot(&body)),
                Err(AdbError::Cancelled) => {
                    debug!("Device tracking cancelled");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `shell:<command> <args>` on `serial` and return its raw output
    pub async fn shell(&mut self, serial: &str, command: &str, args: &[&str]) -> Result<String, AdbError> {
        self.transport(serial).await?;

        let mut request = format!("shell:{}", command);
        for arg in args {
            request.push(' ');
            if arg.contains(' ') {
                request.push_str(&format!("\"{}\"", arg));
            } else {
                request.push_str(arg);
            }
        }

        self.send_command(request.trim_end()).await?;
        self.read_reply_body().await
    }

    pub async fn get_prop(&mut self, serial: &str, property: &str) -> Result<String, AdbError> {
        let output = self.shell(serial, "getprop", &[property]).await?;
        Ok(output.trim().to_string())
    }

    pub async fn get_all_props(&mut self, serial: &str) -> Result<BTreeMap<String, String>, AdbError> {
        let output = self.shell(serial, "getprop", &[]).await?;
        Ok(parse_props(&output))
    }

    pub async fn get_features(&mut self, serial: &str) -> Result<Vec<String>, AdbError> {
        let output = self.shell(serial, "pm", &["list", "features"]).await?;
        Ok(parse_features(&output))
    }
}

/// Parse `getprop` output: `[key]: [value]` per line, empty values dropped
pub fn parse_props(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| PROP_LINE.captures(line.trim()))
        .filter_map(|caps| {
            let key = caps.name("key")?.as_str().trim();
            let value = caps.name("value")?.as_str();
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse `pm list features` output: `feature:<name>` per line
pub fn parse_features(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let prefix = line.get(..8)?;
            if !prefix.eq_ignore_ascii_case("feature:") {
                return None;
            }
            let name = &line[8..];
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn frame(payload: &str) -> Vec<u8> {
        format!("{:04x}{}", payload.len(), payload).into_bytes()
    }

    async fn read_request(stream: &mut TcpStream) -> Option<String> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.ok()?;
        let len = usize::from_str_radix(std::str::from_utf8(&header).ok()?, 16).ok()?;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.ok()?;
        String::from_utf8(payload).ok()
    }

    /// Fake daemon running `handler` for every accepted connection
    async fn fake_daemon<F, Fut>(handler: F) -> u16
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handler(stream));
            }
        });

        port
    }

    fn client(port: u16) -> AdbdClient {
        AdbdClient::new(&AdbServerConfig {
            port,
            backoff_base_ms: 10,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_list_devices() {
        let port = fake_daemon(|mut stream| async move {
            assert_eq!(read_request(&mut stream).await.as_deref(), Some("host:devices-l"));
            let body = "emulator-5554\tdevice\tmodel:Pixel_5\nemulator-5556\toffline\n";
            let mut reply = OKAY.to_vec();
            reply.extend(frame(body));
            stream.write_all(&reply).await.unwrap();
        })
        .await;

        let mut adbd = client(port);
        let devices = adbd.list_devices().await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].state, DeviceState::Device);
        assert_eq!(devices[0].model.as_deref(), Some("Pixel_5"));
        assert!(!adbd.is_connected());
    }

    #[tokio::test]
    async fn test_fail_carries_reason() {
        let port = fake_daemon(|mut stream| async move {
            read_request(&mut stream).await;
            let mut reply = FAIL.to_vec();
            reply.extend(frame("device 'emulator-5580' not found"));
            stream.write_all(&reply).await.unwrap();
        })
        .await;

        let mut adbd = client(port);
        let err = adbd.transport("emulator-5580").await.unwrap_err();

        match err {
            AdbError::CommandRejected { command, reason } => {
                assert_eq!(command, "host:transport:emulator-5580");
                assert_eq!(reason, "device 'emulator-5580' not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!adbd.is_connected());
    }

    #[tokio::test]
    async fn test_transport_is_cached() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let port = fake_daemon(move |mut stream| {
            let seen = Arc::clone(&seen);
            async move {
                while let Some(request) = read_request(&mut stream).await {
                    seen.lock().unwrap().push(request);
                    if stream.write_all(OKAY).await.is_err() {
                        break;
                    }
                }
            }
        })
        .await;

        let mut adbd = client(port);
        adbd.transport("emulator-5554").await.unwrap();
        adbd.transport("emulator-5554").await.unwrap();
        assert_eq!(adbd.current_transport(), Some("emulator-5554"));
        assert_eq!(*requests.lock().unwrap(), vec!["host:transport:emulator-5554"]);

        adbd.transport("emulator-5556").await.unwrap();
        assert_eq!(requests.lock().unwrap().len(), 2);
        assert_eq!(adbd.current_transport(), Some("emulator-5556"));
    }

    #[tokio::test]
    async fn test_shell_reads_until_close() {
        let port = fake_daemon(|mut stream| async move {
            assert_eq!(
                read_request(&mut stream).await.as_deref(),
                Some("host:transport:emulator-5554")
            );
            stream.write_all(OKAY).await.unwrap();

            assert_eq!(
                read_request(&mut stream).await.as_deref(),
                Some("shell:getprop dev.bootcomplete; getprop sys.boot_completed")
            );
            // Status and unframed output arrive in one write
            stream.write_all(b"OKAY\n1\n").await.unwrap();
        })
        .await;

        let mut adbd = client(port);
        let output = adbd
            .shell("emulator-5554", "getprop dev.bootcomplete; getprop sys.boot_completed", &[])
            .await
            .unwrap();

        assert_eq!(output, "\n1\n");
        assert!(adbd.current_transport().is_none());
    }

    #[tokio::test]
    async fn test_host_version() {
        let port = fake_daemon(|mut stream| async move {
            read_request(&mut stream).await;
            let mut reply = OKAY.to_vec();
            reply.extend(frame("0029"));
            stream.write_all(&reply).await.unwrap();
        })
        .await;

        assert_eq!(client(port).host_version().await.unwrap(), 41);
    }

    #[tokio::test]
    async fn test_watch_devices_delivers_snapshots_in_order() {
        let port = fake_daemon(|mut stream| async move {
            assert_eq!(read_request(&mut stream).await.as_deref(), Some("host:track-devices-l"));
            stream.write_all(OKAY).await.unwrap();

            for body in ["emulator-5554\toffline\n", "emulator-5554\tdevice\n", ""] {
                let bytes = frame(body);
                // Split each frame across writes
                let (head, tail) = bytes.split_at(bytes.len() / 2);
                stream.write_all(head).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                stream.write_all(tail).await.unwrap();
            }

            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await;

        let token = CancellationToken::new();
        let mut adbd = client(port).with_cancellation(token.clone());
        let mut snapshots = Vec::new();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            adbd.watch_devices(|devices| {
                snapshots.push(devices);
                if snapshots.len() == 3 {
                    token.cancel();
                }
            }),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0][0].state, DeviceState::Offline);
        assert_eq!(snapshots[1][0].state, DeviceState::Device);
        assert!(snapshots[2].is_empty());
    }

    struct CountingServer {
        kills: AtomicUsize,
        starts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ServerControl for CountingServer {
        async fn kill_server(&self) -> Result<(), AdbError> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn start_server(&self) -> Result<(), AdbError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unreachable_daemon_restarts_server_until_cancelled() {
        // Reserve a port and free it so nothing listens there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let server = Arc::new(CountingServer {
            kills: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        });
        let token = CancellationToken::new();
        let mut adbd = AdbdClient::new(&AdbServerConfig {
            port,
            backoff_base_ms: 10,
            restart_after_failures: 2,
            ..Default::default()
        })
        .with_server_control(server.clone())
        .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let err = tokio_test::assert_err!(adbd.connect().await);
        canceller.await.unwrap();

        assert!(matches!(err, AdbError::Cancelled));
        assert!(server.kills.load(Ordering::SeqCst) >= 1);
        assert!(server.starts.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_backoff_grows_until_capped() {
        let mut delay = Duration::from_secs(1);
        let mut delays = vec![delay];
        for _ in 0..10 {
            delay = next_backoff(delay, 1.5);
            delays.push(delay);
        }

        assert_eq!(
            &delays[..4],
            &[
                Duration::from_millis(1000),
                Duration::from_millis(1500),
                Duration::from_millis(2250),
                Duration::from_micros(3_375_000),
            ]
        );
        assert_eq!(delays[8], Duration::from_secs_f64(25.62890625));
        // 1.5^9 s is past the cap
        assert_eq!(delays[9], MAX_BACKOFF);
        assert_eq!(delays[10], MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let token = CancellationToken::new();
        token.cancel();

        let mut adbd = client(1).with_cancellation(token);
        assert!(matches!(adbd.list_devices().await, Err(AdbError::Cancelled)));
    }

    #[test]
    fn test_parse_props() {
        let output = "[dev.bootcomplete]: [1]\n\
                      [ro.product.model]: [sdk_gphone64_x86_64]\n\
                      [ro.empty]: []\n\
                      garbage line\n";
        let props = parse_props(output);

        assert_eq!(props.len(), 2);
        assert_eq!(props["dev.bootcomplete"], "1");
        assert_eq!(props["ro.product.model"], "sdk_gphone64_x86_64");
    }

    #[test]
    fn test_parse_features() {
        let output = "feature:android.hardware.camera\nFEATURE:android.software.webview\nfeature:\nnoise\n";
        assert_eq!(
            parse_features(output),
            vec!["android.hardware.camera", "android.software.webview"]
        );
    }
}
