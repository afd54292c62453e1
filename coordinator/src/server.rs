// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Listening coordinator
//!
//! Owns the TCP listener, the accept thread and one thread per agent
//! connection, and exposes the blocking request API to callers.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use shutter_protocol::{
    CodecConfig, DEFAULT_PORT, Orientation, PORT_ANNOUNCEMENT_PREFIX, ProtocolError,
    ScreenshotRequest,
};

use crate::mailbox::Mailbox;
use crate::naming::{sanitize_component, screenshot_name};
use crate::session::{Session, SessionConfig};
use crate::{CoordinatorError, Result};

/// Coordinator configuration
///
/// Every field has a default, so a config file only needs the ones it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address to listen on
    pub bind_address: String,
    /// Port to listen on; 0 picks a free one and announces it
    pub port: u16,
    /// How long `request_screenshot` waits for a request to complete
    pub request_timeout_ms: u64,
    /// How long a session waits for each handshake reply
    pub reply_timeout_ms: u64,
    /// Pause between I/O attempts that make no progress
    pub retry_interval_ms: u64,
    /// Consecutive stalled writes before a session gives up
    pub max_write_stalls: u32,
    /// Idle session and accept loop poll interval
    pub idle_poll_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            request_timeout_ms: 10_000,
            reply_timeout_ms: 5_000,
            retry_interval_ms: 10,
            max_write_stalls: 5,
            idle_poll_ms: 100,
        }
    }
}

impl CoordinatorConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text)
            .map_err(|e| CoordinatorError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            codec: CodecConfig {
                retry_interval: Duration::from_millis(self.retry_interval_ms),
                max_write_stalls: self.max_write_stalls,
            },
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            capture_timeout: self.request_timeout(),
            idle_poll: self.idle_poll(),
        }
    }
}

/// Running coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    local_addr: SocketAddr,
    mailbox: Arc<Mailbox>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Bind the listener and start accepting agents.
    pub fn bind(config: CoordinatorConfig) -> Result<Self> {
        let address = format!("{}:{}", config.bind_address, config.port);
        let bind_error = |source| CoordinatorError::Bind {
            address: address.clone(),
            source,
        };

        let listener = TcpListener::bind(&address).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        if config.port == 0 {
            info!("{PORT_ANNOUNCEMENT_PREFIX}{}", local_addr.port());
        }
        info!("Coordinator listening on {local_addr}");

        let mailbox = Arc::new(Mailbox::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let acceptor = Acceptor {
                listener,
                mailbox: Arc::clone(&mailbox),
                shutdown: Arc::clone(&shutdown),
                session_config: config.session_config(),
                poll: config.idle_poll(),
            };
            thread::Builder::new()
                .name("shutter-accept".to_string())
                .spawn(move || acceptor.run())?
        };

        Ok(Self {
            config,
            local_addr,
            mailbox,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Ask the connected agent for a screenshot and block until it is stored,
    /// the request fails, or the request timeout passes.
    pub fn request_screenshot(
        &self,
        name: &str,
        class_name: &str,
        method_name: &str,
        orientation: Orientation,
    ) -> Result<()> {
        let request = ScreenshotRequest::new(name, class_name, method_name, orientation);
        request.validate().map_err(CoordinatorError::InvalidRequest)?;

        let deadline = Instant::now() + self.config.request_timeout();
        let handle = self.mailbox.publish(request, Some(deadline))?;
        info!("Requested screenshot {name} for {class_name}#{method_name} ({orientation})");

        match handle.wait(Some(deadline)) {
            Ok(()) => {
                info!("Screenshot {name} captured");
                Ok(())
            }
            Err(e) => {
                warn!("Screenshot {name} failed: {e}");
                Err(e)
            }
        }
    }

    /// Like [`Coordinator::request_screenshot`], but builds a timestamped
    /// name from `tag` and sanitizes the test identity. Returns the name
    /// sent to the agent.
    pub fn request_tagged(
        &self,
        tag: &str,
        class_name: &str,
        method_name: &str,
        orientation: Orientation,
    ) -> Result<String> {
        let name = screenshot_name(tag)?;
        self.request_screenshot(
            &name,
            &sanitize_component(class_name),
            &sanitize_component(method_name),
            orientation,
        )?;
        Ok(name)
    }

    /// Stop accepting agents and fail any request no session has picked up.
    ///
    /// Idle sessions close their connections; a session in the middle of a
    /// capture finishes it first. Blocks until every session thread exited.
    pub fn shutdown(&self) {
        let accept_thread = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(accept_thread) = accept_thread else {
            return;
        };

        info!("Shutting down coordinator on {}", self.local_addr);
        self.mailbox.close();
        self.shutdown.store(true, Ordering::SeqCst);
        if accept_thread.join().is_err() {
            error!("Accept thread panicked");
        }
        info!("Coordinator stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Acceptor {
    listener: TcpListener,
    mailbox: Arc<Mailbox>,
    shutdown: Arc<AtomicBool>,
    session_config: SessionConfig,
    poll: Duration,
}

impl Acceptor {
    fn run(self) {
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.spawn_session(stream, peer) {
                    Ok(handle) => sessions.push(handle),
                    Err(e) => warn!("Failed to start session for {peer}: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(self.poll),
                Err(e) => {
                    warn!("Accept failed: {e}");
                    thread::sleep(self.poll);
                }
            }
            sessions.retain(|session| !session.is_finished());
        }

        drop(self.listener);
        for session in sessions {
            if session.join().is_err() {
                error!("Session thread panicked");
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<JoinHandle<()>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let mailbox = Arc::clone(&self.mailbox);
        let shutdown = Arc::clone(&self.shutdown);
        let config = self.session_config.clone();

        thread::Builder::new()
            .name(format!("shutter-session-{peer}"))
            .spawn(move || {
                info!("Agent connected from {peer}");
                let mut session = Session::new(stream, peer.to_string(), config);
                match session.run(&mailbox, &shutdown) {
                    Ok(()) => info!("Session {peer} closed"),
                    Err(ProtocolError::Eof) => info!("Agent {peer} disconnected"),
                    Err(e) if e.is_violation() => error!("Session {peer}: {e}"),
                    Err(e) => warn!("Session {peer} terminated: {e}"),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.port, 42042);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));

        let session = config.session_config();
        assert_eq!(session.codec.max_write_stalls, 5);
        assert_eq!(session.capture_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_partial_json() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"port": 0, "request_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_config_rejects_unknown_types() {
        serde_json::from_str::<CoordinatorConfig>(r#"{"port": "high"}"#).unwrap_err();
    }

    #[test]
    fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = CoordinatorConfig {
            port: taken.local_addr().unwrap().port(),
            ..Default::default()
        };
        assert!(matches!(
            Coordinator::bind(config),
            Err(CoordinatorError::Bind { .. })
        ));
    }

    #[test]
    fn test_invalid_request_rejected_before_publish() {
        let coordinator = Coordinator::bind(CoordinatorConfig {
            port: 0,
            ..Default::default()
        })
        .unwrap();

        let err = coordinator
            .request_screenshot("bad\nname", "LoginTest", "testTap", Orientation::Portrait)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidRequest(_)));
        assert!(matches!(
            coordinator.request_tagged("no spaces", "LoginTest", "testTap", Orientation::Portrait),
            Err(CoordinatorError::InvalidTag(_))
        ));
        coordinator.shutdown();
        assert!(coordinator.is_shut_down());
    }
}
