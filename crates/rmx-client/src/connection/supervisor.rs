//! Health probe and reconnection
//!
//! One task per connect cycle. It alternates between probing and, after a
//! failed probe, reconnecting; the two never overlap. The task holds only a
//! weak reference between iterations so a dropped connection ends it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rmx_core::{ConnectError, ConnectionState};

use super::{close_session, establish, lock, ssh, Connection, ConnectionEvent, Inner};

/// The no-op command used as a liveness probe
const PROBE_COMMAND: &str = "true";

pub(super) async fn run(inner: Weak<Inner>, token: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let conn = Connection { inner: strong };

        if let Err(e) = probe(&conn).await {
            if token.is_cancelled() || !begin_reconnect(&conn, &e) {
                return;
            }
            let first_delay = conn.inner.backoff.delay_for_attempt(0);
            drop(conn);
            if !reconnect(&inner, &token, first_delay).await {
                return;
            }
        }
    }
}

async fn probe(conn: &Connection) -> Result<(), ConnectError> {
    let session = conn
        .inner
        .session
        .get()
        .ok_or(ConnectError::NotConnected {
            state: conn.state(),
        })?;
    let timeout = conn.inner.settings.health_probe_timeout;
    let output = ssh::exec(&session, PROBE_COMMAND, Some(timeout)).await?;
    tracing::trace!(connection_id = %conn.id(), exit_code = ?output.exit_code, "Health probe ok");
    Ok(())
}

fn begin_reconnect(conn: &Connection, error: &ConnectError) -> bool {
    let mut status = lock(&conn.inner.status);
    status.attempt = 0;
    status.last_error = Some(error.clone());
    if !conn.transition(&mut status, ConnectionState::Reconnecting, Some(error)) {
        return false;
    }
    drop(status);

    if let Some(old) = conn.inner.session.replace(None) {
        close_session(old);
    }
    true
}

/// Retry until connected, cancelled, dropped, or out of attempts. Returns
/// true when the connection is back in `Connected`. The connection is only
/// upgraded for the duration of each attempt.
async fn reconnect(inner: &Weak<Inner>, token: &CancellationToken, first_delay: Duration) -> bool {
    let mut attempt = 0u32;
    let mut delay = first_delay;

    loop {
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(strong) = inner.upgrade() else {
            return false;
        };
        let conn = Connection { inner: strong };
        tracing::info!(connection_id = %conn.id(), "Reconnecting (attempt {})", attempt + 1);

        let result = tokio::select! {
            _ = token.cancelled() => return false,
            result = establish(&conn.inner.config) => result,
        };

        let e = match result {
            Ok(session) => return finish(&conn, session, token),
            Err(e) => e,
        };

        attempt = attempt.saturating_add(1);
        let exhausted = conn
            .inner
            .settings
            .max_reconnect_attempts
            .map_or(false, |max| attempt >= max);

        let mut status = lock(&conn.inner.status);
        if status.state != ConnectionState::Reconnecting {
            return false;
        }
        status.attempt = attempt;
        status.last_error = Some(e.clone());

        if !e.is_retryable() || exhausted {
            conn.transition(&mut status, ConnectionState::Error, Some(&e));
            return false;
        }
        drop(status);

        delay = conn.inner.backoff.delay_for_attempt(attempt);
        tracing::info!(connection_id = %conn.id(), "Reconnect failed, retrying in {:?}: {}", delay, e);
        let _ = conn.inner.events.send(ConnectionEvent::Retrying {
            id: conn.id().clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: e.to_string(),
        });
    }
}

fn finish(conn: &Connection, session: Arc<super::SshSession>, token: &CancellationToken) -> bool {
    let mut status = lock(&conn.inner.status);
    if token.is_cancelled() || status.state != ConnectionState::Reconnecting {
        drop(status);
        close_session(session);
        return false;
    }
    conn.inner.session.replace(Some(session));
    status.attempt = 0;
    status.last_error = None;
    conn.transition(&mut status, ConnectionState::Connected, None)
}
