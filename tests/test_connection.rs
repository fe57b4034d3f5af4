//! End-to-end tests for the connection lifecycle over an in-memory stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ferrule::config::{AccessConfig, AccessKind, Config, RewriteConfig, RewriteTarget};
use ferrule::context::{RequestContext, ServerContext, vars};
use ferrule::error::{ConfigError, RequestError};
use ferrule::http::connection::ConnectionHandler;
use ferrule::http::request::Request;
use ferrule::http::response::{Response, StatusCode};
use ferrule::http::socket::LineSocket;
use ferrule::module::access::AccessModule;
use ferrule::module::rewrite::RewriteModule;
use ferrule::module::{Hook, Module, ModulePipeline};
use ferrule::server::WorkerHandle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Answers every request with the working request path.
#[derive(Default)]
struct Echo {
    served: Arc<AtomicUsize>,
}

#[async_trait]
impl Module for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn init(&mut self, _server: Arc<ServerContext>) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn process(
        &mut self,
        _request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook == Hook::RequestPost {
            self.served.fetch_add(1, Ordering::SeqCst);
            response.set_header("Content-Type", "text/plain");
            response.set_body(ctx.server_var(vars::X_REQUEST_URI).unwrap_or("").to_string());
            response.dispatch();
        }
        Ok(())
    }
}

/// Logs every hook it sees and optionally dispatches.
struct Recorder {
    name: &'static str,
    dispatch: bool,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Module for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&mut self, _server: Arc<ServerContext>) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn process(
        &mut self,
        _request: &mut Request,
        response: &mut Response,
        _ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        self.log.lock().unwrap().push(format!("{}:{hook}", self.name));
        if hook == Hook::RequestPost && self.dispatch {
            response.set_status(StatusCode::NO_CONTENT);
            response.dispatch();
        }
        Ok(())
    }
}

struct Panicker;

#[async_trait]
impl Module for Panicker {
    fn name(&self) -> &'static str {
        "panicker"
    }

    fn init(&mut self, _server: Arc<ServerContext>) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn process(
        &mut self,
        _request: &mut Request,
        _response: &mut Response,
        _ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook == Hook::RequestPost {
            panic!("module exploded");
        }
        Ok(())
    }
}

/// Feeds `input` to a fresh connection and returns everything the server wrote.
async fn exchange(
    server: Arc<ServerContext>,
    modules: Vec<Box<dyn Module>>,
    input: &[u8],
) -> (String, WorkerHandle) {
    let mut pipeline = ModulePipeline::build(&server, modules).unwrap();
    exchange_with(server, &mut pipeline, input).await
}

async fn exchange_with(
    server: Arc<ServerContext>,
    pipeline: &mut ModulePipeline,
    input: &[u8],
) -> (String, WorkerHandle) {
    let (mut client, server_side) = tokio::io::duplex(256 * 1024);
    client.write_all(input).await.unwrap();
    client.shutdown().await.unwrap();

    let worker = WorkerHandle::new(0);
    let socket = LineSocket::new(server_side, "127.0.0.1:50000".parse().unwrap());
    let handler = ConnectionHandler::new(server, pipeline);

    let mut output = Vec::new();
    let (_, read) = tokio::join!(handler.handle(socket, &worker), client.read_to_end(&mut output));
    read.unwrap();

    (String::from_utf8_lossy(&output).into_owned(), worker)
}

fn server(configure: impl FnOnce(&mut Config)) -> Arc<ServerContext> {
    let mut config = Config::default();
    configure(&mut config);
    ServerContext::new(config)
}

fn echo() -> Box<dyn Module> {
    Box::new(Echo::default())
}

#[tokio::test]
async fn test_simple_request_is_answered_and_closed() {
    let (output, worker) = exchange(
        server(|_| {}),
        vec![echo()],
        b"GET /hello?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(output.contains("Connection: close\r\n"));
    assert!(output.contains("Content-Length: 6\r\n"));
    assert!(output.contains("Server: ferrule/"));
    assert!(output.contains("Date: "));
    assert!(output.ends_with("\r\n\r\n/hello"));
    assert!(!worker.is_shutdown_requested());
}

#[tokio::test]
async fn test_without_keep_alive_only_first_request_is_served() {
    let echo = Echo::default();
    let served = Arc::clone(&echo.served);

    let (output, _) = exchange(
        server(|_| {}),
        vec![Box::new(echo)],
        b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
    )
    .await;

    assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 1);
    assert_eq!(served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keep_alive_stops_after_max_requests() {
    let request = "GET /n HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
    let input = request.repeat(7);

    let (output, _) = exchange(
        server(|c| c.server.keep_alive_max = 5),
        vec![echo()],
        input.as_bytes(),
    )
    .await;

    // Five keep-alive responses, then a sixth that closes the connection.
    assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 6);
    assert_eq!(output.matches("Connection: keep-alive\r\n").count(), 5);
    assert_eq!(output.matches("Connection: close\r\n").count(), 1);
    assert!(output.contains("Keep-Alive: timeout=15, max=4\r\n"));
    assert!(output.contains("Keep-Alive: timeout=15, max=0\r\n"));

    let last = output.rsplit("HTTP/1.1 200 OK").next().unwrap();
    assert!(last.contains("Connection: close\r\n"));
    assert!(!last.contains("Keep-Alive:"));
}

#[tokio::test]
async fn test_leading_blank_line_is_skipped() {
    let (output, _) = exchange(
        server(|_| {}),
        vec![echo()],
        b"\r\nGET /robust HTTP/1.1\r\n\r\n",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(output.ends_with("/robust"));
}

#[tokio::test]
async fn test_oversized_body_is_rejected_before_keep_alive() {
    let echo = Echo::default();
    let served = Arc::clone(&echo.served);

    let (output, _) = exchange(
        server(|c| c.server.max_body_size = 8),
        vec![Box::new(echo)],
        b"POST /upload HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 100\r\n\r\n",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(output.contains("exceeds max size"));
    assert!(output.contains("Connection: close\r\n"));
    assert!(!output.contains("Keep-Alive:"));
    assert_eq!(served.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_conflicting_content_length_in_other_case_is_rejected() {
    let echo = Echo::default();
    let served = Arc::clone(&echo.served);

    let (output, _) = exchange(
        server(|c| c.server.max_body_size = 8),
        vec![Box::new(echo)],
        b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\ncontent-length: 4000\r\n\r\nabcd",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(served.load(Ordering::SeqCst), 0);

    let (output, _) = exchange(
        server(|c| c.server.max_body_size = 8),
        vec![self::echo()],
        b"POST /upload HTTP/1.1\r\ncontent-length: 4000\r\n\r\n",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(output.contains("exceeds max size"));
}

#[tokio::test]
async fn test_repeated_header_in_any_case_is_joined_into_server_var() {
    struct TokenVar;

    #[async_trait]
    impl Module for TokenVar {
        fn name(&self) -> &'static str {
            "token"
        }

        fn init(&mut self, _server: Arc<ServerContext>) -> Result<(), ConfigError> {
            Ok(())
        }

        async fn process(
            &mut self,
            _request: &mut Request,
            response: &mut Response,
            ctx: &mut RequestContext,
            hook: Hook,
        ) -> Result<(), RequestError> {
            if hook == Hook::RequestPost {
                response.set_body(ctx.server_var("HTTP_X_TOKEN").unwrap_or("-").to_string());
                response.dispatch();
            }
            Ok(())
        }
    }

    for _ in 0..10 {
        let (output, _) = exchange(
            server(|_| {}),
            vec![Box::new(TokenVar)],
            b"GET / HTTP/1.1\r\nX-Token: a\r\nx-token: b\r\n\r\n",
        )
        .await;

        assert!(output.ends_with("\r\n\r\na, b"));
    }
}

#[tokio::test]
async fn test_form_body_is_decoded_into_params() {
    struct Params;

    #[async_trait]
    impl Module for Params {
        fn name(&self) -> &'static str {
            "params"
        }

        fn init(&mut self, _server: Arc<ServerContext>) -> Result<(), ConfigError> {
            Ok(())
        }

        async fn process(
            &mut self,
            request: &mut Request,
            response: &mut Response,
            _ctx: &mut RequestContext,
            hook: Hook,
        ) -> Result<(), RequestError> {
            if hook == Hook::RequestPost {
                let body = format!(
                    "{}|{}",
                    request.param("q").unwrap_or("-"),
                    request.param("name").unwrap_or("-")
                );
                response.set_body(body);
                response.dispatch();
            }
            Ok(())
        }
    }

    let (output, _) = exchange(
        server(|_| {}),
        vec![Box::new(Params)],
        b"POST /form?q=rust HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 12\r\n\r\nname=ferrule",
    )
    .await;

    assert!(output.ends_with("rust|ferrule"));
}

#[tokio::test]
async fn test_dispatch_short_circuits_request_post_only() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let modules: Vec<Box<dyn Module>> = vec![
        Box::new(Recorder {
            name: "first",
            dispatch: true,
            log: Arc::clone(&log),
        }),
        Box::new(Recorder {
            name: "second",
            dispatch: false,
            log: Arc::clone(&log),
        }),
    ];

    let (output, _) = exchange(server(|_| {}), modules, b"GET / HTTP/1.1\r\n\r\n").await;

    assert!(output.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(!output.contains("Content-Length"));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "first:REQUEST_PRE",
            "second:REQUEST_PRE",
            "first:REQUEST_POST",
            "first:RESPONSE_PRE",
            "second:RESPONSE_PRE",
            "first:RESPONSE_POST",
            "second:RESPONSE_POST",
        ]
    );
}

#[tokio::test]
async fn test_undispatched_request_is_an_error() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let modules: Vec<Box<dyn Module>> = vec![Box::new(Recorder {
        name: "idle",
        dispatch: false,
        log,
    })];

    let (output, _) = exchange(server(|_| {}), modules, b"GET / HTTP/1.1\r\n\r\n").await;

    assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(output.contains("Request has not been dispatched"));
    assert!(output.contains("Content-Type: text/plain"));
}

#[tokio::test]
async fn test_error_before_send_replaces_response_with_error_page() {
    struct Veto;

    #[async_trait]
    impl Module for Veto {
        fn name(&self) -> &'static str {
            "veto"
        }

        fn init(&mut self, _server: Arc<ServerContext>) -> Result<(), ConfigError> {
            Ok(())
        }

        async fn process(
            &mut self,
            _request: &mut Request,
            response: &mut Response,
            _ctx: &mut RequestContext,
            hook: Hook,
        ) -> Result<(), RequestError> {
            if hook == Hook::ResponsePre {
                response.set_header("Content-Type", "application/x-withheld");
                return Err(RequestError::forbidden("Response withheld"));
            }
            Ok(())
        }
    }

    let (output, _) = exchange(
        server(|_| {}),
        vec![echo(), Box::new(Veto)],
        b"GET /secret HTTP/1.1\r\n\r\n",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(output.contains("Response withheld"));
    assert!(!output.contains("application/x-withheld"));
    assert!(!output.ends_with("/secret"));
}

#[tokio::test]
async fn test_malformed_request_line_is_bad_request() {
    let (output, _) = exchange(server(|_| {}), vec![echo()], b"GARBAGE\r\n\r\n").await;

    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn test_transport_failures_send_nothing() {
    let (output, _) = exchange(server(|_| {}), vec![echo()], b"").await;
    assert!(output.is_empty());

    let (output, _) = exchange(server(|_| {}), vec![echo()], b"GET / HTTP/1.1\r\nHost: a\r\n").await;
    assert!(output.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_is_dropped_after_read_timeout() {
    for input in [&b""[..], &b"GET / HTTP/1.1\r\nHost: a\r\n"[..]] {
        let server = server(|c| c.server.read_timeout_secs = 3);
        let mut pipeline = ModulePipeline::build(&server, vec![echo()]).unwrap();

        // The client never shuts down its side.
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        client.write_all(input).await.unwrap();

        let worker = WorkerHandle::new(0);
        let socket = LineSocket::new(server_side, "127.0.0.1:50000".parse().unwrap());
        let handler = ConnectionHandler::new(server, &mut pipeline);

        let started = tokio::time::Instant::now();
        let mut output = Vec::new();
        let (_, read) = tokio::join!(handler.handle(socket, &worker), client.read_to_end(&mut output));
        read.unwrap();

        assert!(output.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!worker.is_shutdown_requested());
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_after_keep_alive_timeout_closes_connection() {
    let server = server(|c| {
        c.server.keep_alive_timeout_secs = 10;
        c.server.read_timeout_secs = 60;
    });
    let mut pipeline = ModulePipeline::build(&server, vec![echo()]).unwrap();
    let (mut client, server_side) = tokio::io::duplex(64 * 1024);

    let worker = WorkerHandle::new(0);
    let socket = LineSocket::new(server_side, "127.0.0.1:50000".parse().unwrap());
    let handler = ConnectionHandler::new(server, &mut pipeline);

    let client_side = async {
        client
            .write_all(b"GET /first HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let mut first = Vec::new();
        let mut chunk = [0u8; 1024];
        while !first.ends_with(b"/first") {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the first response");
            first.extend_from_slice(&chunk[..n]);
        }

        tokio::time::sleep(Duration::from_secs(11)).await;

        client
            .write_all(b"GET /second HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        (
            String::from_utf8_lossy(&first).into_owned(),
            String::from_utf8_lossy(&rest).into_owned(),
        )
    };

    let (_, (first, second)) = tokio::join!(handler.handle(socket, &worker), client_side);

    assert!(first.contains("Connection: keep-alive\r\n"));
    assert!(first.contains("Keep-Alive: timeout=10, max="));

    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(second.ends_with("/second"));
    assert!(second.contains("Connection: close\r\n"));
    assert!(!second.contains("Keep-Alive:"));
}

#[tokio::test]
async fn test_panic_sends_500_and_requests_respawn() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let modules: Vec<Box<dyn Module>> = vec![
        Box::new(Recorder {
            name: "observer",
            dispatch: false,
            log: Arc::clone(&log),
        }),
        Box::new(Panicker),
    ];

    let (output, worker) = exchange(
        server(|_| {}),
        modules,
        b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\nGET / HTTP/1.1\r\n\r\n",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert_eq!(output.matches("HTTP/1.1 ").count(), 1);
    assert!(output.contains("Connection: close\r\n"));
    assert!(worker.is_shutdown_requested());
    assert!(log.lock().unwrap().contains(&"observer:SHUTDOWN".to_string()));
}

#[tokio::test]
async fn test_rewrite_redirect_stops_the_pipeline() {
    let echo = Echo::default();
    let served = Arc::clone(&echo.served);
    let server = server(|c| {
        c.rewrites = vec![RewriteConfig {
            condition: "^/old/(.*)$".to_string(),
            target: RewriteTarget::Literal("/new/$1".to_string()),
            flag: "R=301".to_string(),
        }];
    });

    let (output, _) = exchange(
        server,
        vec![Box::new(RewriteModule::default()), Box::new(echo)],
        b"GET /old/page HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;

    assert!(output.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
    assert!(output.contains("Location: http://example.com/new/page\r\n"));
    assert_eq!(served.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rewrite_to_existing_file_sets_script_filename() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("foo"), b"foo contents").unwrap();
    let root_path = root.path().to_path_buf();

    struct Script;

    #[async_trait]
    impl Module for Script {
        fn name(&self) -> &'static str {
            "script"
        }

        fn init(&mut self, _server: Arc<ServerContext>) -> Result<(), ConfigError> {
            Ok(())
        }

        async fn process(
            &mut self,
            _request: &mut Request,
            response: &mut Response,
            ctx: &mut RequestContext,
            hook: Hook,
        ) -> Result<(), RequestError> {
            if hook == Hook::RequestPost {
                let body = format!(
                    "{}|{}",
                    ctx.server_var(vars::REDIRECT_STATUS).unwrap_or("-"),
                    ctx.server_var(vars::SCRIPT_FILENAME).unwrap_or("-")
                );
                response.set_body(body);
                response.dispatch();
            }
            Ok(())
        }
    }

    let server = server(|c| {
        c.server.document_root = root_path.clone();
        c.rewrites = vec![RewriteConfig {
            condition: "-f@$REQUEST_FILENAME".to_string(),
            target: RewriteTarget::Literal("$REQUEST_FILENAME".to_string()),
            flag: String::new(),
        }];
    });

    let (output, _) = exchange(
        server,
        vec![Box::new(RewriteModule::default()), Box::new(Script)],
        b"GET /foo HTTP/1.1\r\n\r\n",
    )
    .await;

    let expected = format!(
        "200|{}/foo",
        root_path.to_string_lossy().trim_end_matches('/')
    );
    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(output.ends_with(&expected), "unexpected response: {output}");
}

#[tokio::test]
async fn test_access_allow_and_deny() {
    let server = server(|c| {
        c.access = vec![
            AccessConfig {
                kind: AccessKind::Allow,
                params: [("X_REQUEST_URI".to_string(), "^/public/".to_string())].into(),
            },
            AccessConfig {
                kind: AccessKind::Deny,
                params: [("HTTP_USER_AGENT".to_string(), "^BadBot".to_string())].into(),
            },
        ];
    });
    let mut pipeline = ModulePipeline::build(
        &server,
        vec![Box::new(AccessModule::default()), echo()],
    )
    .unwrap();

    let (permitted, _) = exchange_with(
        Arc::clone(&server),
        &mut pipeline,
        b"GET /public/a HTTP/1.1\r\nUser-Agent: curl\r\n\r\n",
    )
    .await;
    assert!(permitted.starts_with("HTTP/1.1 200 OK\r\n"));

    let (denied, _) = exchange_with(
        Arc::clone(&server),
        &mut pipeline,
        b"GET /public/a HTTP/1.1\r\nUser-Agent: BadBot/1.0\r\n\r\n",
    )
    .await;
    assert!(denied.starts_with("HTTP/1.1 403 Forbidden\r\n"));

    let (not_allowed, _) = exchange_with(
        Arc::clone(&server),
        &mut pipeline,
        b"GET /private HTTP/1.1\r\nUser-Agent: curl\r\n\r\n",
    )
    .await;
    assert!(not_allowed.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[tokio::test]
async fn test_static_files_through_configured_modules() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), b"<h1>home</h1>").unwrap();
    std::fs::write(root.path().join("style.css"), b"body {}").unwrap();
    let root_path = root.path().to_path_buf();

    let server = server(|c| {
        c.server.document_root = root_path;
        c.modules = vec!["directory".to_string(), "core".to_string()];
    });
    let mut pipeline = ModulePipeline::from_config(&server).unwrap();

    let (index, _) = exchange_with(Arc::clone(&server), &mut pipeline, b"GET / HTTP/1.1\r\n\r\n").await;
    assert!(index.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(index.contains("Content-Type: text/html"));
    assert!(index.contains("Last-Modified: "));
    assert!(index.ends_with("<h1>home</h1>"));

    let (head, _) = exchange_with(
        Arc::clone(&server),
        &mut pipeline,
        b"HEAD /style.css HTTP/1.1\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 7\r\n"));
    assert!(head.ends_with("\r\n\r\n"));

    let (missing, _) = exchange_with(
        Arc::clone(&server),
        &mut pipeline,
        b"GET /nope.html HTTP/1.1\r\n\r\n",
    )
    .await;
    assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let (traversal, _) = exchange_with(
        Arc::clone(&server),
        &mut pipeline,
        b"GET /%2e%2e/etc/passwd HTTP/1.1\r\n\r\n",
    )
    .await;
    assert!(traversal.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}
