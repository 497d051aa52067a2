use std::{convert::Infallible, time::Duration};

use bytes::Bytes;
use clap::Parser;
use gangway::{ApplicationConfig, entrypoint};
use http_body_util::{BodyExt, Full};
use hyper::{
    Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

// Echo the proxying headers back in the body so the test can assert on them.
async fn backend_service(
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_owned()
    };
    let body = format!(
        "{}|{}|{}",
        header("X-Forwarded-Host"),
        header("X-Forwarded-Proto"),
        header("X-Forwarded-Port"),
    );
    Ok(Response::new(Full::new(Bytes::from(body))))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn http_director() {
    // 1. Start an HTTP backend on a random port
    let backend_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Backend bind failed");
    let backend_port = backend_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = backend_listener.accept().await.unwrap();
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(backend_service))
                    .await;
            });
        }
    });

    // 2. Initialize Gangway
    let routes_path = std::env::temp_dir().join("gangway-http-director-routes.json");
    std::fs::write(
        &routes_path,
        r#"[{"id": "aaabbbcccddd", "instances": [{"address": "10.0.0.1", "host": "127.0.0.1"}]}]"#,
    )
    .unwrap();
    let config = ApplicationConfig::parse_from([
        "gangway".into(),
        "--listen-address=127.0.0.1".into(),
        "--http-port=18580".into(),
        "--tls-port=18581".into(),
        "--ssh-port=18582".into(),
        "--disable-dns".into(),
        "--disable-daemon".into(),
        "--http-request-timeout=5s".into(),
        format!(
            "--private-key-file={}",
            std::env::temp_dir()
                .join("gangway-http-director-keys/ssh")
                .display()
        ),
        format!("--routes-file={}", routes_path.display()),
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18582").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Gangway to start.")
    };

    // 3. A direct-form Host with an encoded port reaches the backend
    let host = format!("ip10-0-0-1-aaabbbcccddd-{backend_port}.direct.labs.tld");
    let stream = TcpStream::connect("127.0.0.1:18580")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(conn);
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header("host", &host)
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(
        response
            .into_body()
            .collect()
            .await
            .expect("Error collecting body")
            .to_bytes()
            .into(),
    )
    .unwrap();
    assert_eq!(
        body,
        format!("ip10-0-0-1-aaabbbcccddd-{backend_port}.direct.labs.tld|http|{backend_port}")
    );

    // 4. A Host outside the grammar is rejected with 404
    let stream = TcpStream::connect("127.0.0.1:18580")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(conn);
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header("host", "www.example.com")
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // 5. A known session but unknown instance is rejected with 404
    let stream = TcpStream::connect("127.0.0.1:18580")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(conn);
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header("host", "ip10-0-0-2-aaabbbcccddd.direct.labs.tld")
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
