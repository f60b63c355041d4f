#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, warn};
use poem::http::header::{HOST, LOCATION};
use poem::http::uri::{Scheme, Uri};
use poem::http::StatusCode;
use poem::web::Data;
use poem::{handler, Request, Response};

use crate::localapi::whois::{IdentityRecord, IdentityResolver};
use crate::utils::config::{RenderMode, RuntimeCtx};
use crate::utils::hello_utils::{debug_request, split_host_port};
use crate::web::render::Renderer;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const HTML_CONTENT_TYPE : &str = "text/html; charset=utf-8";
const TEXT_CONTENT_TYPE : &str = "text/plain; charset=utf-8";

const NO_REMOTE_ADDR    : &str = "no remote addr";
const LOOKUP_FAILED     : &str = "Your Tailscale works, but we failed to look you up.";

// ***************************************************************************
//                                  Types
// ***************************************************************************
/// What to do when the caller's identity can't be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFailure {
    /// Answer 500.
    FailFast,
    /// Log and show the canned identity instead.
    FallbackFixture,
}

impl From<RenderMode> for LookupFailure {
    fn from(mode: RenderMode) -> Self {
        match mode {
            RenderMode::Dev => LookupFailure::FallbackFixture,
            RenderMode::Production => LookupFailure::FailFast,
        }
    }
}

/// Plain http requests are sent to https when an https listener exists.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    pub https_enabled: bool,
    pub virtual_ip: String,
    pub public_hostname: String,
}

/// The parts of an incoming request the dispatcher looks at.
#[derive(Debug, Clone)]
pub struct CallerRequest {
    pub secure: bool,
    pub host: String,
    pub request_uri: String,
    pub remote_addr: String,
}

impl CallerRequest {
    /** Pull the dispatcher's inputs out of a poem request.  The endpoint is
     * served unnested, so the request's uri is the request target.
     */
    pub fn from_request(req: &Request) -> Self {
        Self::from_parts(
            req.scheme(),
            req.header(HOST),
            req.uri(),
            req.remote_addr().as_socket_addr().copied(),
        )
    }

    // -----------------------------------------------------------------------
    // from_parts:
    // -----------------------------------------------------------------------
    /** An absolute-form target ("http://host/") is kept whole so it never
     * compares equal to "/".  IPv4 peers seen through a dual-stack socket
     * arrive as ::ffff:a.b.c.d and are unmapped.  A remote that is not a
     * socket address leaves remote_addr empty.
     */
    pub fn from_parts(scheme: &Scheme, host: Option<&str>, uri: &Uri, remote: Option<SocketAddr>) -> Self {
        let host = host
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let request_uri = if uri.scheme().is_some() {
            uri.to_string()
        } else {
            uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| uri.path().to_string())
        };
        let remote_addr = remote
            .map(|a| SocketAddr::new(a.ip().to_canonical(), a.port()).to_string())
            .unwrap_or_default();
        CallerRequest {
            secure: *scheme == Scheme::HTTPS,
            host,
            request_uri,
            remote_addr,
        }
    }
}

// ***************************************************************************
//                                Dispatcher
// ***************************************************************************
pub struct Dispatcher {
    resolver: Arc<dyn IdentityResolver>,
    renderer: Renderer,
    redirect: RedirectPolicy,
    on_lookup_failure: LookupFailure,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn IdentityResolver>, renderer: Renderer,
               redirect: RedirectPolicy, on_lookup_failure: LookupFailure) -> Self {
        Dispatcher { resolver, renderer, redirect, on_lookup_failure }
    }

    /// Wire up a dispatcher from the startup context.
    pub fn from_ctx(ctx: &RuntimeCtx, resolver: Arc<dyn IdentityResolver>, renderer: Renderer) -> Self {
        let redirect = RedirectPolicy {
            https_enabled: ctx.https_addr.is_some(),
            virtual_ip: ctx.parms.config.virtual_ip.clone(),
            public_hostname: ctx.parms.config.public_hostname.clone(),
        };
        Self::new(resolver, renderer, redirect, ctx.mode.into())
    }

    // -----------------------------------------------------------------------
    // dispatch:
    // -----------------------------------------------------------------------
    /** Run one request through https redirect, path canonicalization, address
     * extraction, lookup and rendering.  Every failure becomes a response.
     */
    pub async fn dispatch(&self, req: &CallerRequest) -> Response {
        if !req.secure && self.redirect.https_enabled {
            let vip = &self.redirect.virtual_ip;
            let host = if !vip.is_empty() && req.host.contains(vip.as_str()) {
                self.redirect.public_hostname.as_str()
            } else {
                req.host.as_str()
            };
            return found(&format!("https://{}", host));
        }

        if req.request_uri != "/" {
            return found("/");
        }

        let ip = match split_host_port(&req.remote_addr) {
            Ok((ip, _)) => ip,
            Err(_) => return plain_error(StatusCode::INTERNAL_SERVER_ERROR, NO_REMOTE_ADDR),
        };

        let data = match self.resolver.who_is(ip).await {
            Ok(who) => IdentityRecord::from_who_is(&who, ip),
            Err(e) => match self.on_lookup_failure {
                LookupFailure::FallbackFixture => {
                    warn!("using fake data in dev mode due to whois lookup error: {}", e);
                    IdentityRecord::fixture()
                }
                LookupFailure::FailFast => {
                    error!("whois({:?}) error: {}", ip, e);
                    return plain_error(StatusCode::INTERNAL_SERVER_ERROR, LOOKUP_FAILED);
                }
            },
        };

        match self.renderer.render(&data).await {
            Ok(html) => Response::builder()
                .status(StatusCode::OK)
                .content_type(HTML_CONTENT_TYPE)
                .body(html),
            Err(e) => {
                error!("{}", e);
                plain_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }
}

// ***************************************************************************
//                                 Endpoint
// ***************************************************************************
// ---------------------------------------------------------------------------
// root:
// ---------------------------------------------------------------------------
/** The only handler; every path and method lands here. */
#[handler]
pub async fn root(http_req: &Request, dispatcher: Data<&Arc<Dispatcher>>) -> Response {
    debug_request(http_req);
    dispatcher.dispatch(&CallerRequest::from_request(http_req)).await
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
fn found(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .finish()
}

fn plain_error(status: StatusCode, msg: &str) -> Response {
    Response::builder()
        .status(status)
        .content_type(TEXT_CONTENT_TYPE)
        .header("X-Content-Type-Options", "nosniff")
        .body(format!("{}\n", msg))
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use poem::{Endpoint, EndpointExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::localapi::whois::{decode_who_is, WhoIsResponse};
    use crate::utils::errors::Errors;

    const SAMPLE: &str = r#"{"UserProfile":{"DisplayName":"Foo Barberson","LoginName":"foo@bar.com","ProfilePicURL":"https://x/y.png"},"Node":{"ComputedName":"imac5k.local","Hostinfo":{"OS":"Linux"}}}"#;
    const TEMPLATE: &str = "{{ DisplayName }}|{{ LoginName }}|{{ ProfilePicURL }}|{{ MachineName }}|{{ MachineOS }}|{{ IP }}";

    // Resolver that answers from a fixed body, or fails, and counts calls.
    struct FakeResolver {
        body: Option<&'static str>,
        calls: AtomicUsize,
        last_ip: std::sync::Mutex<String>,
    }

    impl FakeResolver {
        fn answering(body: &'static str) -> Arc<Self> {
            Arc::new(FakeResolver { body: Some(body), calls: AtomicUsize::new(0), last_ip: Default::default() })
        }
        fn failing() -> Arc<Self> {
            Arc::new(FakeResolver { body: None, calls: AtomicUsize::new(0), last_ip: Default::default() })
        }
    }

    #[async_trait]
    impl IdentityResolver for FakeResolver {
        async fn who_is(&self, ip: &str) -> Result<WhoIsResponse, Errors> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_ip.lock().unwrap() = ip.to_string();
            match self.body {
                Some(b) => decode_who_is(b.as_bytes()),
                None => Err(Errors::Transport("dial /var/run/tailscale/tailscaled.sock: connection refused".to_string())),
            }
        }
    }

    fn policy(https_enabled: bool) -> RedirectPolicy {
        RedirectPolicy {
            https_enabled,
            virtual_ip: "100.101.102.103".to_string(),
            public_hostname: "hello.ipn.dev".to_string(),
        }
    }

    fn dispatcher(resolver: Arc<FakeResolver>, https_enabled: bool, on_failure: LookupFailure) -> Dispatcher {
        Dispatcher::new(resolver, Renderer::production(TEMPLATE).unwrap(), policy(https_enabled), on_failure)
    }

    fn get(secure: bool, host: &str, uri: &str, remote: &str) -> CallerRequest {
        CallerRequest {
            secure,
            host: host.to_string(),
            request_uri: uri.to_string(),
            remote_addr: remote.to_string(),
        }
    }

    fn location(resp: &Response) -> Option<String> {
        resp.headers().get(LOCATION).map(|v| v.to_str().unwrap().to_string())
    }

    async fn body(resp: Response) -> String {
        resp.into_body().into_string().await.unwrap()
    }

    #[tokio::test]
    async fn renders_resolved_identity() {
        let r = FakeResolver::answering(SAMPLE);
        let d = dispatcher(r.clone(), true, LookupFailure::FailFast);

        let resp = d.dispatch(&get(true, "hello.ipn.dev", "/", "100.2.3.4:51515")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), HTML_CONTENT_TYPE);
        assert_eq!(body(resp).await, "Foo Barberson|foo@bar.com|https:&#x2F;&#x2F;x&#x2F;y.png|imac5k|Linux|100.2.3.4");
        assert_eq!(*r.last_ip.lock().unwrap(), "100.2.3.4");
    }

    #[tokio::test]
    async fn ipv6_caller_is_looked_up_without_brackets() {
        let r = FakeResolver::answering(SAMPLE);
        let d = dispatcher(r.clone(), false, LookupFailure::FailFast);

        let resp = d.dispatch(&get(false, "h", "/", "[fd7a:115c:a1e0::1]:443")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*r.last_ip.lock().unwrap(), "fd7a:115c:a1e0::1");
    }

    #[tokio::test]
    async fn dev_mode_falls_back_to_fixture() {
        let r = FakeResolver::failing();
        let d = dispatcher(r.clone(), false, LookupFailure::FallbackFixture);

        let resp = d.dispatch(&get(false, "localhost:8080", "/", "127.0.0.1:40000")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await,
                   "Taily Scalerson|taily@scaler.son|https:&#x2F;&#x2F;placekitten.com&#x2F;200&#x2F;200|scaled|Linux|100.1.2.3");
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn production_lookup_failure_is_500() {
        let r = FakeResolver::failing();
        let d = dispatcher(r.clone(), true, LookupFailure::FailFast);

        let resp = d.dispatch(&get(true, "hello.ipn.dev", "/", "100.2.3.4:1")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers().get("content-type").unwrap(), TEXT_CONTENT_TYPE);
        assert_eq!(body(resp).await, format!("{}\n", LOOKUP_FAILED));
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_paths_redirect_to_root() {
        let r = FakeResolver::answering(SAMPLE);
        let d = dispatcher(r.clone(), false, LookupFailure::FailFast);

        for uri in ["/foo", "//", "/?x=1", "/index.html", ""] {
            let resp = d.dispatch(&get(false, "h", uri, "100.2.3.4:1")).await;
            assert_eq!(resp.status(), StatusCode::FOUND, "{uri}");
            assert_eq!(location(&resp).as_deref(), Some("/"), "{uri}");
        }
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn plain_http_redirects_to_https_host() {
        let d = dispatcher(FakeResolver::answering(SAMPLE), true, LookupFailure::FailFast);

        let resp = d.dispatch(&get(false, "hello.example.ts.net", "/foo", "100.2.3.4:1")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(location(&resp).as_deref(), Some("https://hello.example.ts.net"));
    }

    #[tokio::test]
    async fn virtual_ip_redirects_to_public_hostname() {
        let d = dispatcher(FakeResolver::answering(SAMPLE), true, LookupFailure::FailFast);

        for host in ["100.101.102.103", "100.101.102.103:80"] {
            let resp = d.dispatch(&get(false, host, "/", "100.2.3.4:1")).await;
            assert_eq!(resp.status(), StatusCode::FOUND);
            assert_eq!(location(&resp).as_deref(), Some("https://hello.ipn.dev"));
        }
    }

    #[tokio::test]
    async fn plain_http_is_served_without_https_listener() {
        let d = dispatcher(FakeResolver::answering(SAMPLE), false, LookupFailure::FailFast);

        let resp = d.dispatch(&get(false, "100.101.102.103", "/", "100.2.3.4:1")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_port_is_no_remote_addr() {
        let r = FakeResolver::answering(SAMPLE);
        let d = dispatcher(r.clone(), false, LookupFailure::FallbackFixture);

        for remote in ["100.2.3.4", "unknown", ""] {
            let resp = d.dispatch(&get(false, "h", "/", remote)).await;
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR, "{remote}");
            assert_eq!(body(resp).await, "no remote addr\n");
        }
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn render_failure_is_500_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let d = Dispatcher::new(FakeResolver::answering(SAMPLE),
                                Renderer::dev(dir.path().join("missing.html")),
                                policy(false), LookupFailure::FallbackFixture);

        let resp = d.dispatch(&get(false, "h", "/", "100.2.3.4:1")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(resp).await.starts_with("template error: reading "));
    }

    #[test]
    fn strategy_follows_mode() {
        assert_eq!(LookupFailure::from(RenderMode::Dev), LookupFailure::FallbackFixture);
        assert_eq!(LookupFailure::from(RenderMode::Production), LookupFailure::FailFast);
    }

    // ------------------------- request adapter -------------------------
    fn parts(scheme: Scheme, host: Option<&str>, uri: &str, remote: Option<&str>) -> CallerRequest {
        let uri: Uri = uri.parse().unwrap();
        let remote = remote.map(|r| r.parse::<SocketAddr>().unwrap());
        CallerRequest::from_parts(&scheme, host, &uri, remote)
    }

    #[test]
    fn scheme_decides_secure() {
        assert!(parts(Scheme::HTTPS, Some("h"), "/", None).secure);
        assert!(!parts(Scheme::HTTP, Some("h"), "/", None).secure);
    }

    #[test]
    fn host_header_then_authority() {
        assert_eq!(parts(Scheme::HTTP, Some("hello.ipn.dev"), "http://other/", None).host, "hello.ipn.dev");
        assert_eq!(parts(Scheme::HTTP, None, "http://100.101.102.103:80/", None).host, "100.101.102.103:80");
        assert_eq!(parts(Scheme::HTTP, None, "/", None).host, "");
    }

    #[test]
    fn request_target_is_kept_verbatim() {
        assert_eq!(parts(Scheme::HTTP, None, "/", None).request_uri, "/");
        assert_eq!(parts(Scheme::HTTP, None, "//", None).request_uri, "//");
        assert_eq!(parts(Scheme::HTTP, None, "/?x=1", None).request_uri, "/?x=1");
        assert_eq!(parts(Scheme::HTTP, None, "http://hello.ipn.dev/", None).request_uri, "http://hello.ipn.dev/");
    }

    #[test]
    fn remote_addr_is_canonical() {
        assert_eq!(parts(Scheme::HTTP, None, "/", Some("100.2.3.4:5000")).remote_addr, "100.2.3.4:5000");
        assert_eq!(parts(Scheme::HTTP, None, "/", Some("[::ffff:100.2.3.4]:5000")).remote_addr, "100.2.3.4:5000");
        assert_eq!(parts(Scheme::HTTP, None, "/", Some("[fd7a:115c:a1e0::1]:443")).remote_addr, "[fd7a:115c:a1e0::1]:443");
        assert_eq!(parts(Scheme::HTTP, None, "/", None).remote_addr, "");
    }

    #[tokio::test]
    async fn mapped_ipv4_caller_is_looked_up_unmapped() {
        let r = FakeResolver::answering(SAMPLE);
        let d = dispatcher(r.clone(), false, LookupFailure::FailFast);

        let req = parts(Scheme::HTTP, Some("h"), "/", Some("[::ffff:100.2.3.4]:5000"));
        assert_eq!(d.dispatch(&req).await.status(), StatusCode::OK);
        assert_eq!(*r.last_ip.lock().unwrap(), "100.2.3.4");
    }

    // Drive the poem endpoint end to end with a built request.
    async fn call_root(d: Dispatcher, req: Request) -> Response {
        root.data(Arc::new(d)).call(req).await.unwrap()
    }

    #[tokio::test]
    async fn endpoint_redirects_non_root_targets() {
        for target in ["//", "/?x=1", "/foo", "http://hello.ipn.dev/"] {
            let d = dispatcher(FakeResolver::answering(SAMPLE), false, LookupFailure::FailFast);
            let req = Request::builder().uri(target.parse::<Uri>().unwrap()).header(HOST, "h").finish();
            let resp = call_root(d, req).await;
            assert_eq!(resp.status(), StatusCode::FOUND, "{target}");
            assert_eq!(location(&resp).as_deref(), Some("/"), "{target}");
        }
    }

    #[tokio::test]
    async fn endpoint_plain_http_without_host_header() {
        let d = dispatcher(FakeResolver::answering(SAMPLE), true, LookupFailure::FailFast);
        let req = Request::builder().uri(Uri::from_static("/")).finish();
        let resp = call_root(d, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(location(&resp).as_deref(), Some("https://"));

        let d = dispatcher(FakeResolver::answering(SAMPLE), true, LookupFailure::FailFast);
        let req = Request::builder().uri(Uri::from_static("http://100.101.102.103/")).finish();
        let resp = call_root(d, req).await;
        assert_eq!(location(&resp).as_deref(), Some("https://hello.ipn.dev"));
    }

    #[tokio::test]
    async fn endpoint_without_socket_peer_is_no_remote_addr() {
        // A built request has no socket peer.
        let r = FakeResolver::answering(SAMPLE);
        let d = dispatcher(r.clone(), false, LookupFailure::FallbackFixture);
        let req = Request::builder().uri(Uri::from_static("/")).header(HOST, "h").finish();
        let resp = call_root(d, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(resp).await, "no remote addr\n");
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }
}
