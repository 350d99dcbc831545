//! Intercepting HTTP proxy
//!
//! A real browser is pointed at this proxy and every request it issues is
//! routed through the session's [`Interceptor`]. `CONNECT` tunnels are
//! terminated here with a leaf certificate minted for the target host, so
//! HTTPS requests reach the interceptor decrypted. When the interceptor
//! answers with `NetworkError` the client connection is dropped without a
//! response.

use axum::body::Body;
use axum::http::uri::Authority;
use axum::http::{header, Request, Response, StatusCode};
use axum::response::IntoResponse;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use webprobe_common::{HarnessError, HarnessResult, Headers, HttpRequest, HttpResponse, Method};

use crate::intercept::{Interceptor, Upstream};

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn tls_error(e: impl std::fmt::Display) -> HarnessError {
    HarnessError::Tls(e.to_string())
}

/// Per-proxy signing authority for intercepted HTTPS hosts
struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    fn generate() -> HarnessResult<Self> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "webprobe interception CA");
        params.distinguished_name.push(DnType::OrganizationName, "webprobe");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate().map_err(tls_error)?;
        let cert = params.self_signed(&key).map_err(tls_error)?;
        Ok(Self {
            cert,
            key,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// TLS server config presenting a leaf for `host`, minted once per host
    fn server_config(&self, host: &str) -> HarnessResult<Arc<ServerConfig>> {
        if let Some(config) = self.leaves.lock().get(host) {
            return Ok(config.clone());
        }

        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(tls_error)?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let key = KeyPair::generate().map_err(tls_error)?;
        let leaf = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(tls_error)?;

        let chain = vec![leaf.der().clone(), self.cert.der().clone()];
        let private = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let mut config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(tls_error)?
                .with_no_client_auth()
                .with_single_cert(chain, private)
                .map_err(tls_error)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.leaves.lock().insert(host.to_string(), config.clone());
        debug!("Minted interception certificate for {}", host);
        Ok(config)
    }
}

struct ProxyState {
    interceptor: Arc<Interceptor>,
    upstream: Arc<dyn Upstream>,
    ca: Arc<CertificateAuthority>,
}

/// Running proxy bound to a local port
pub struct InterceptProxy {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl InterceptProxy {
    /// Bind `listen` (port 0 picks a free port) and start serving
    pub async fn start(
        listen: &str,
        interceptor: Arc<Interceptor>,
        upstream: Arc<dyn Upstream>,
    ) -> HarnessResult<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| HarnessError::ServerStartup(format!("proxy bind {}: {}", listen, e)))?;
        let addr = listener.local_addr()?;

        let state = Arc::new(ProxyState {
            interceptor,
            upstream,
            ca: Arc::new(CertificateAuthority::generate()?),
        });

        let (tx, mut rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            trace!("Proxy connection from {}", peer);
                            tokio::spawn(serve_client(state.clone(), stream));
                        }
                        Err(e) => warn!("Intercept proxy accept failed: {}", e),
                    },
                }
            }
        });

        info!("Intercept proxy listening on {}", addr);
        Ok(Self {
            addr,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    /// `host:port` form used in browser proxy capabilities
    pub fn proxy_address(&self) -> String {
        self.addr.to_string()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("Intercept proxy on {} stopped", self.addr);
    }
}

impl Drop for InterceptProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Serve one browser connection; CONNECT upgrades it to an HTTPS tunnel
async fn serve_client(state: Arc<ProxyState>, stream: TcpStream) {
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move {
            if req.method() == axum::http::Method::CONNECT {
                return Ok(tunnel(state, req));
            }
            forward(&state, req.map(Body::new), None).await
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        trace!("Proxy connection closed: {}", e);
    }
}

/// Route one request through the interceptor; an `Err` drops the connection
async fn forward(
    state: &ProxyState,
    req: Request<Body>,
    origin: Option<&str>,
) -> HarnessResult<Response<Body>> {
    let request = match to_harness_request(req, origin).await {
        Ok(r) => r,
        Err(e) => return Ok((StatusCode::BAD_REQUEST, e.to_string()).into_response()),
    };

    match state.interceptor.fetch(request, state.upstream.as_ref()).await {
        Ok(resp) => Ok(to_axum_response(resp)),
        Err(e) => {
            trace!("Dropping proxied connection: {}", e);
            Err(e)
        }
    }
}

/// `https://host[:port]`, omitting the default port
fn https_origin(authority: &Authority) -> String {
    match authority.port_u16() {
        Some(443) | None => format!("https://{}", authority.host()),
        Some(port) => format!("https://{}:{}", authority.host(), port),
    }
}

/// Answer a CONNECT with 200, then terminate TLS on the upgraded connection
fn tunnel(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<Body> {
    let Some(authority) = req.uri().authority().cloned() else {
        return (StatusCode::BAD_REQUEST, "CONNECT without authority").into_response();
    };
    let tls = match state.ca.server_config(authority.host()) {
        Ok(config) => config,
        Err(e) => {
            warn!("No certificate for {}: {}", authority, e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(u) => u,
            Err(e) => {
                warn!("CONNECT upgrade failed: {}", e);
                return;
            }
        };
        let stream = match TlsAcceptor::from(tls).accept(TokioIo::new(upgraded)).await {
            Ok(s) => s,
            Err(e) => {
                debug!("TLS handshake for {} failed: {}", authority, e);
                return;
            }
        };

        let origin = https_origin(&authority);
        let service = service_fn(move |req: Request<Incoming>| {
            let state = state.clone();
            let origin = origin.clone();
            async move { forward(&state, req.map(Body::new), Some(&origin)).await }
        });
        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            trace!("Tunnel to {} closed: {}", authority, e);
        }
    });

    Response::new(Body::empty())
}

/// Build the interceptor's view of a proxied request.
///
/// Plain proxied requests carry absolute-form URIs. Requests inside a
/// tunnel are origin-form and take `origin` from the CONNECT authority.
async fn to_harness_request(req: Request<Body>, origin: Option<&str>) -> HarnessResult<HttpRequest> {
    let (parts, body) = req.into_parts();
    let method: Method = parts.method.as_str().parse()?;

    let url = if parts.uri.scheme().is_some() {
        parts.uri.to_string()
    } else {
        let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        match origin {
            Some(origin) => format!("{}{}", origin, path),
            None => {
                let host = parts
                    .headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .ok_or_else(|| HarnessError::InvalidInput("request without Host header".into()))?;
                format!("http://{}{}", host, path)
            }
        }
    };

    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect::<Headers>();

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| HarnessError::InvalidInput(format!("unreadable request body: {}", e)))?;

    let mut request = HttpRequest::new(method, url).with_body(body);
    request.headers = headers;
    Ok(request)
}

fn to_axum_response(resp: HttpResponse) -> Response<Body> {
    let mut builder = Response::builder().status(resp.status);
    for (name, value) in resp.headers.iter() {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|e| (StatusCode::BAD_GATEWAY, e.to_string()).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::{InterceptRule, RejectUpstream, StaticResponse};
    use serde_json::json;
    use std::time::Duration;
    use webprobe_common::RuleOrdering;

    async fn proxy_with(rule: InterceptRule) -> (InterceptProxy, Arc<Interceptor>) {
        let interceptor = Arc::new(Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1)));
        interceptor.register(rule).unwrap();
        let proxy = InterceptProxy::start("127.0.0.1:0", interceptor.clone(), Arc::new(RejectUpstream))
            .await
            .unwrap();
        (proxy, interceptor)
    }

    /// Trusts the minted leaves the way a browser with `acceptInsecureCerts` does
    fn client(proxy: &InterceptProxy) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", proxy.proxy_address())).unwrap())
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mocked_response_through_proxy() {
        let rule = InterceptRule::get("/api")
            .unwrap()
            .alias("getAllKeys")
            .reply(StaticResponse::json(200, &json!({ "keys": ["42"] })));
        let (proxy, interceptor) = proxy_with(rule).await;

        let resp = client(&proxy).get("http://cache.test/api").send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["keys"][0], "42");

        let exchange = interceptor.wait_for("getAllKeys", None).await.unwrap();
        assert_eq!(exchange.request.url, "http://cache.test/api");
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_https_request_reaches_interceptor() {
        let rule = InterceptRule::any("/calc")
            .unwrap()
            .alias("calcRequest")
            .reply(StaticResponse::json(200, &json!({ "results": [{ "out": "4" }] })));
        let (proxy, interceptor) = proxy_with(rule).await;

        let resp = client(&proxy)
            .post("https://calc.test/calc")
            .body("in[]=2%2B2")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["results"][0]["out"], "4");

        let exchange = interceptor
            .wait_for("calcRequest", Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(exchange.request.method, Method::Post);
        assert_eq!(exchange.request.url, "https://calc.test/calc");
        assert_eq!(exchange.request.body.as_ref(), b"in[]=2%2B2");
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_network_error_drops_connection() {
        let rule = InterceptRule::get("/calc").unwrap().reply(StaticResponse::network_error());
        let (proxy, interceptor) = proxy_with(rule).await;

        let err = client(&proxy).get("http://calc.test/calc").send().await.unwrap_err();
        assert!(err.status().is_none());
        assert!(interceptor.traffic()[0].is_network_error());
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_network_error_inside_tunnel() {
        let rule = InterceptRule::any("/calc").unwrap().reply(StaticResponse::network_error());
        let (proxy, interceptor) = proxy_with(rule).await;

        let err = client(&proxy).get("https://calc.test/calc").send().await.unwrap_err();
        assert!(err.status().is_none());
        assert_eq!(interceptor.traffic()[0].request.url, "https://calc.test/calc");
        proxy.stop().await;
    }

    #[test]
    fn test_leaf_config_minted_once_per_host() {
        let ca = CertificateAuthority::generate().unwrap();
        let first = ca.server_config("calc.test").unwrap();
        let again = ca.server_config("calc.test").unwrap();
        let other = ca.server_config("127.0.0.1").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_https_origin_omits_default_port() {
        let default: Authority = "calc.test:443".parse().unwrap();
        let custom: Authority = "127.0.0.1:8443".parse().unwrap();
        assert_eq!(https_origin(&default), "https://calc.test");
        assert_eq!(https_origin(&custom), "https://127.0.0.1:8443");
    }
}
