use std::io::{self, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::extract::{ConnectInfo, Request as HttpRequest, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response as HttpResponse};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::context::RuntimeContext;
use crate::launcher::{CommandOutcome, Service};
use crate::plugins::import_listener;
use crate::request_log::RequestRecord;
use crate::responders::{Request, Response};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    runtime: Runtime,
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    serving: JoinHandle<io::Result<()>>,
}

/// Wiki service bound to the context's port.
pub struct WikiServer {
    context: Arc<RuntimeContext>,
    running: Option<Running>,
}

impl WikiServer {
    pub fn new(context: RuntimeContext) -> Self {
        Self {
            context: Arc::new(context),
            running: None,
        }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Serve until interrupted with Ctrl-C, then drain open connections.
    pub fn wait(mut self) -> Result<()> {
        let Some(Running {
            runtime,
            shutdown,
            mut serving,
            ..
        }) = self.running.take()
        else {
            return Ok(());
        };
        let finished = runtime.block_on(async {
            tokio::select! {
                served = &mut serving => Some(served),
                _ = tokio::signal::ctrl_c() => None,
            }
        });
        let served = match finished {
            Some(served) => served,
            None => {
                info!("Interrupted, shutting down");
                let _ = shutdown.send(());
                runtime.block_on(serving)
            }
        };
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        served
            .context("HTTP server task failed")?
            .context("HTTP server failed")
    }
}

impl Service for WikiServer {
    fn start(&mut self) -> Result<bool> {
        if self.running.is_some() {
            return Ok(true);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("fitnesse-http")
            .build()
            .context("failed to build HTTP runtime")?;

        let port = self.context.port();
        let listener = match runtime.block_on(TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))) {
            Ok(listener) => listener,
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                error!("FitNesse cannot be started: port {port} is already in use");
                return Ok(false);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to bind port {port}"));
            }
        };
        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = router(Arc::clone(&self.context));
        let serving = runtime.spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = signal.await;
            })
            .await
        });

        info!(address = %local_addr, "FitNesse started");
        self.running = Some(Running {
            runtime,
            local_addr,
            shutdown,
            serving,
        });
        Ok(true)
    }

    fn execute_single_command(
        &mut self,
        command: &str,
        output: &mut dyn Write,
    ) -> Result<CommandOutcome> {
        let request = Request::parse(command);
        if let Some(listener) = import_listener() {
            listener.before_command(self.context.root(), &request.page);
        }
        let response = dispatch(&self.context, &request)?;
        output
            .write_all(&response.body)
            .context("failed to write command output")?;
        Ok(CommandOutcome {
            failures: response.failures,
        })
    }

    fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(());
        let served = running.runtime.block_on(running.serving);
        running.runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        served
            .context("HTTP server task failed")?
            .context("HTTP server failed")?;
        info!("FitNesse stopped");
        Ok(())
    }
}

impl Drop for WikiServer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("failed to stop server: {err:#}");
        }
    }
}

/// Route a request to its responder. A missing responder is an infrastructure error.
pub fn dispatch(context: &RuntimeContext, request: &Request) -> Result<Response> {
    let name = request.responder_name();
    let responder = context
        .registries()
        .responders
        .get(name)
        .ok_or_else(|| anyhow!("no responder registered for `{name}`"))?;
    responder
        .respond(context, request)
        .with_context(|| format!("responder `{name}` failed for {}", request.page))
}

/// Every path is a page; logging wraps authentication so rejected requests are logged too.
fn router(context: Arc<RuntimeContext>) -> Router {
    Router::new()
        .fallback(serve_page)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&context),
            require_credentials,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&context),
            log_request,
        ))
        .with_state(context)
}

async fn serve_page(
    State(context): State<Arc<RuntimeContext>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> HttpResponse {
    if method != Method::GET {
        return into_http(Response {
            status: StatusCode::METHOD_NOT_ALLOWED.as_u16(),
            ..Response::text("Only GET is supported.\n")
        });
    }
    let target = uri.path_and_query().map_or("/", |target| target.as_str());
    let mut request = Request::parse(target);
    request.user = basic_credentials(&headers).map(|(user, _)| user);

    let response = match tokio::task::spawn_blocking(move || dispatch(&context, &request)).await
    {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            error!("{err:#}");
            internal_error(format!("{err:#}\n"))
        }
        Err(err) => {
            error!("request handler failed: {err}");
            internal_error("Request handler failed.\n".to_string())
        }
    };
    into_http(response)
}

async fn require_credentials(
    State(context): State<Arc<RuntimeContext>>,
    request: HttpRequest,
    next: Next,
) -> HttpResponse {
    let authenticator = context.authenticator();
    if authenticator.requires_credentials() {
        let credentials = basic_credentials(request.headers());
        let allowed = authenticator.is_authenticated(
            credentials.as_ref().map(|(user, _)| user.as_str()),
            credentials.as_ref().map(|(_, password)| password.as_str()),
        );
        if !allowed {
            return into_http(Response::unauthorized());
        }
    }
    next.run(request).await
}

async fn log_request(
    State(context): State<Arc<RuntimeContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: HttpRequest,
    next: Next,
) -> HttpResponse {
    let request_line = format!(
        "{} {} {:?}",
        request.method(),
        request.uri(),
        request.version()
    );
    let user = basic_credentials(request.headers()).map(|(user, _)| user);

    let response = next.run(request).await;

    if let Some(logger) = context.logger() {
        let record = RequestRecord {
            peer: Some(peer),
            request_line,
            user,
            status: response.status().as_u16(),
            bytes: response
                .extensions()
                .get::<BodyLength>()
                .map_or(0, |length| length.0),
        };
        if let Err(err) = logger.log(&record) {
            warn!("failed to log request: {err:#}");
        }
    }
    response
}

/// Body size of a wiki response, carried to the request logger.
#[derive(Debug, Clone, Copy)]
struct BodyLength(usize);

fn internal_error(body: String) -> Response {
    Response {
        status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        ..Response::text(body)
    }
}

fn into_http(response: Response) -> HttpResponse {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let length = BodyLength(response.body.len());
    let mut http = (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response();
    if status == StatusCode::UNAUTHORIZED {
        http.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"FitNesse\""),
        );
    }
    http.extensions_mut().insert(length);
    http
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    parse_basic_credentials(value.trim())
}

fn parse_basic_credentials(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::io::Read;
    use std::net::{TcpListener as StdTcpListener, TcpStream};

    use tempfile::TempDir;

    use super::*;
    use crate::arguments::parse_command_line;
    use crate::components::ComponentRegistry;
    use crate::config::merge_configuration;
    use crate::context::build_context;

    fn test_server(extra: &[&str]) -> (TempDir, WikiServer) {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs = temp.path().join("logs");
        let mut args = vec![
            "-p",
            "0",
            "-d",
            temp.path().to_str().expect("utf8"),
            "-l",
            logs.to_str().expect("utf8"),
        ];
        args.extend_from_slice(extra);
        let arguments = parse_command_line(args).expect("parse");
        let config = merge_configuration(BTreeMap::new(), &arguments);
        let context = build_context(&arguments, &config, &ComponentRegistry::with_defaults())
            .expect("context");
        let page = context.root().directory().join("FrontPage");
        fs::create_dir_all(page.join("ChildPage")).expect("pages");
        fs::write(page.join("content.txt"), "front page text").expect("write");
        fs::write(page.join("ChildPage/content.txt"), "child").expect("write");

        let outside = temp.path().join("outside");
        fs::create_dir_all(outside.join("Secret")).expect("outside");
        fs::write(outside.join("content.txt"), "outside the wiki").expect("write");
        fs::write(outside.join("Secret/content.txt"), "secret").expect("write");
        (temp, WikiServer::new(context))
    }

    fn send(addr: SocketAddr, method: &str, target: &str, extra_headers: &str) -> String {
        let mut stream =
            TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).expect("connect");
        write!(
            stream,
            "{method} {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n{extra_headers}\r\n"
        )
        .expect("send");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read");
        response
    }

    fn get(addr: SocketAddr, target: &str, extra_headers: &str) -> String {
        send(addr, "GET", target, extra_headers)
    }

    #[test]
    fn single_command_writes_body_and_counts_failures() {
        let (_temp, mut server) = test_server(&[]);
        let mut output = Vec::new();
        let outcome = server
            .execute_single_command("FrontPage", &mut output)
            .expect("command");
        assert_eq!(outcome.failures, 0);
        assert_eq!(String::from_utf8(output).expect("utf8"), "front page text");

        let mut output = Vec::new();
        let outcome = server
            .execute_single_command("NoSuchPage", &mut output)
            .expect("command");
        assert_eq!(outcome.failures, 1);
    }

    #[test]
    fn names_command_lists_children() {
        let (_temp, mut server) = test_server(&[]);
        let mut output = Vec::new();
        server
            .execute_single_command("FrontPage?names", &mut output)
            .expect("command");
        assert_eq!(String::from_utf8(output).expect("utf8"), "ChildPage\n");
    }

    #[test]
    fn commands_cannot_read_outside_the_root() {
        let (temp, mut server) = test_server(&[]);
        let outside = temp.path().join("outside");
        let escape = format!("x.{}", outside.display());

        for command in [escape.clone(), format!("{escape}?names")] {
            let mut output = Vec::new();
            let outcome = server
                .execute_single_command(&command, &mut output)
                .expect("command");
            assert_eq!(outcome.failures, 1, "command `{command}`");
            let body = String::from_utf8(output).expect("utf8");
            assert!(!body.contains("outside the wiki"));
            assert!(!body.contains("Secret"));
        }
    }

    #[test]
    fn unknown_responder_is_an_error() {
        let (_temp, mut server) = test_server(&[]);
        let err = server
            .execute_single_command("FrontPage?suite", &mut Vec::new())
            .expect_err("must fail");
        assert!(err.to_string().contains("no responder registered for `suite`"));
    }

    #[test]
    fn serves_pages_over_http_until_stopped() {
        let (temp, mut server) = test_server(&[]);
        assert!(server.start().expect("start"));
        let addr = server.local_addr().expect("addr");

        let response = get(addr, "/FrontPage", "");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("front page text"));

        let response = get(addr, "/Missing", "");
        assert!(response.starts_with("HTTP/1.1 404"));

        let response = send(addr, "POST", "/FrontPage", "Content-Length: 0\r\n");
        assert!(response.starts_with("HTTP/1.1 405"));

        server.stop().expect("stop");
        assert!(server.local_addr().is_none());

        let log = fs::read_to_string(temp.path().join("logs/fitnesse-requests.log"))
            .expect("request log");
        assert_eq!(log.lines().count(), 3);
        assert!(log.contains("\"GET /Missing HTTP/1.1\" 404"));
        assert!(log.contains("\"GET /FrontPage HTTP/1.1\" 200 15"));
    }

    #[test]
    fn http_requests_cannot_leave_the_root() {
        let (temp, mut server) = test_server(&[]);
        server.start().expect("start");
        let addr = server.local_addr().expect("addr");
        let outside = temp.path().join("outside");

        let response = get(addr, &format!("/x.{}", outside.display()), "");
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(!response.contains("outside the wiki"));
        server.stop().expect("stop");
    }

    #[test]
    fn credentials_are_required_when_configured() {
        let (temp, mut server) = test_server(&["-a", "bob:secret"]);
        server.start().expect("start");
        let addr = server.local_addr().expect("addr");

        let response = get(addr, "/FrontPage", "");
        assert!(response.starts_with("HTTP/1.1 401"));
        assert!(response.contains("www-authenticate: Basic realm=\"FitNesse\""));
        let header = format!("Authorization: Basic {}\r\n", STANDARD.encode("bob:secret"));
        assert!(get(addr, "/FrontPage", &header).starts_with("HTTP/1.1 200"));
        server.stop().expect("stop");

        let log = fs::read_to_string(temp.path().join("logs/fitnesse-requests.log"))
            .expect("request log");
        assert!(log.contains(" - - ["));
        assert!(log.contains(" - bob ["));
    }

    #[test]
    fn busy_port_reports_not_started() {
        let blocker = StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).expect("blocker");
        let port = blocker.local_addr().expect("addr").port().to_string();
        let temp = tempfile::tempdir().expect("tempdir");
        let arguments =
            parse_command_line(["-p", port.as_str(), "-d", temp.path().to_str().expect("utf8")])
                .expect("parse");
        let config = merge_configuration(BTreeMap::new(), &arguments);
        let context = build_context(&arguments, &config, &ComponentRegistry::with_defaults())
            .expect("context");
        let mut server = WikiServer::new(context);
        assert!(!server.start().expect("start"));
    }

    #[test]
    fn basic_credentials_decode() {
        let header = format!("Basic {}", STANDARD.encode("alice:wonder:land"));
        assert_eq!(
            parse_basic_credentials(&header),
            Some(("alice".to_string(), "wonder:land".to_string()))
        );
        assert_eq!(parse_basic_credentials("Bearer abc"), None);
    }
}
