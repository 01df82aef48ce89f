//! The request/reply socket to the server.
//!
//! One TLS connection carries length-delimited postcard envelopes, strictly
//! one request in flight at a time: the underlying socket assumes matched
//! request/response pairs, so a mutex is held across send+receive. The
//! client's token and UUID are injected into every request just before
//! encoding.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use crate::codec;
use crate::config::{ClientConfig, TlsConfig};
use crate::error::{DroverError, Result};
use crate::protocol::{ClientRequest, Method, ServerResponse};

type Connection = Framed<TlsStream<TcpStream>, LengthDelimitedCodec>;

pub(crate) struct Transport {
    conn: Mutex<Connection>,
    client_id: Uuid,
    token: Vec<u8>,
    timeout: Duration,
}

impl Transport {
    /// Dial the server and establish the TLS session. Reachability is not
    /// verified here; callers should follow up with a ping.
    pub(crate) async fn connect(config: &ClientConfig, client_id: Uuid) -> Result<Self> {
        let tcp = tokio::time::timeout(config.timeout, TcpStream::connect(&config.addr))
            .await
            .map_err(|_| DroverError::NoServer)?
            .map_err(|_| DroverError::NoServer)?;

        let tls_config = client_tls_config(&config.tls)?;
        let server_name = ServerName::try_from(config.tls.server_name.clone())
            .map_err(|e| DroverError::Tls(format!("invalid server name: {e}")))?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| DroverError::Tls(format!("TLS handshake failed: {e}")))?;

        // responses can carry whole result sets plus a database image, so
        // the receive size is unbounded
        let mut framing = LengthDelimitedCodec::new();
        framing.set_max_frame_length(usize::MAX);

        Ok(Self {
            conn: Mutex::new(Framed::new(stream, framing)),
            client_id,
            token: config.token.clone(),
            timeout: config.timeout,
        })
    }

    /// Shut the connection down. Any request after this fails.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.close().await?;
        Ok(())
    }

    /// Send one request and await its reply. The connection lock is held
    /// for the whole exchange, giving exactly one outstanding request per
    /// client.
    pub(crate) async fn request(&self, mut req: ClientRequest) -> Result<ServerResponse> {
        let mut conn = self.conn.lock().await;

        req.token = self.token.clone();
        req.client_id = self.client_id;
        let method = req.method;
        let job_key = req.job.as_ref().map(|j| j.key()).unwrap_or_default();
        let deadline = deadline_for(self.timeout, &req);
        let encoded = codec::encode(&req)?;

        conn.send(Bytes::from(encoded)).await?;

        let frame = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, conn.next())
                .await
                .map_err(|_| DroverError::Timeout)?,
            None => conn.next().await,
        };
        let frame = match frame {
            Some(frame) => frame?,
            None => return Err(DroverError::NoServer),
        };

        let resp: ServerResponse = codec::decode(&frame)?;
        if !resp.err.is_empty() {
            return Err(DroverError::Server {
                method: method.as_str(),
                job_key,
                msg: resp.err,
            });
        }
        Ok(resp)
    }
}

/// The receive deadline for a request. Requests that carry their own
/// timeout (reserve) extend the connection deadline by that amount; a zero
/// reserve timeout means wait indefinitely for a job, so no deadline
/// applies at all.
fn deadline_for(conn_timeout: Duration, req: &ClientRequest) -> Option<Duration> {
    if req.method == Method::Reserve {
        if req.timeout.is_zero() {
            return None;
        }
        return Some(conn_timeout + req.timeout);
    }
    Some(conn_timeout)
}

fn client_tls_config(tls: &TlsConfig) -> Result<tokio_rustls::rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();

    let mut pinned = false;
    if let Some(path) = &tls.ca_cert_path {
        if let Ok(pem) = std::fs::read(path) {
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert
                    .map_err(|e| DroverError::Tls(format!("bad CA certificate: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| DroverError::Tls(format!("bad CA certificate: {e}")))?;
                pinned = true;
            }
        }
    }

    // no usable pinned CA: trust whatever the system trusts, as for any
    // publicly signed server certificate
    if !pinned {
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
    }

    Ok(tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_extends_for_timed_reserves() {
        let conn_timeout = Duration::from_secs(10);

        let ping = ClientRequest::new(Method::Ping);
        assert_eq!(deadline_for(conn_timeout, &ping), Some(conn_timeout));

        let mut reserve = ClientRequest::new(Method::Reserve);
        reserve.timeout = Duration::from_secs(30);
        assert_eq!(
            deadline_for(conn_timeout, &reserve),
            Some(Duration::from_secs(40))
        );
    }

    #[test]
    fn zero_timeout_reserve_waits_indefinitely() {
        let mut reserve = ClientRequest::new(Method::Reserve);
        reserve.timeout = Duration::ZERO;
        assert_eq!(deadline_for(Duration::from_secs(10), &reserve), None);
    }
}
