use fulmen_codec::value::{PairMap, Value};
use fulmen_codec::ProtocolVersion;
use fulmen_network::facades::BoltClient;
use fulmen_network::framing::{Bearer, FrameBuffer};
use fulmen_network::handshake::{VersionOffer, MAGIC};
use fulmen_network::message::{Auth, Request, Response, ServerFailure, TxMetadata};
use fulmen_network::session::{Error, Session, SessionConfig, State};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;

async fn accept_handshake(stream: &mut DuplexStream, selected: u32) {
    let mut opening = [0u8; 20];
    stream.read_exact(&mut opening).await.unwrap();

    assert_eq!(&opening[..4], &MAGIC);

    stream.write_all(&selected.to_be_bytes()).await.unwrap();
    stream.flush().await.unwrap();
}

/// The server half of a conversation, scripted by each test
struct ServerHalf<S> {
    frames: FrameBuffer<S>,
    version: ProtocolVersion,
}

impl<S> ServerHalf<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn new(stream: S, version: ProtocolVersion) -> Self {
        Self {
            frames: FrameBuffer::new(stream),
            version,
        }
    }

    async fn expect(&mut self, name: &'static str) -> Request {
        let raw = self.frames.read_message().await.unwrap();
        let request = Request::from_bytes(&raw, self.version).unwrap();

        assert_eq!(request.name(), name);

        request
    }

    async fn reply(&mut self, response: Response) {
        let bytes = response.to_bytes(self.version).unwrap();
        self.frames.write_message(&bytes).await.unwrap();
    }

    async fn reply_success(&mut self, entries: Vec<(&str, Value)>) {
        let metadata: PairMap = entries.into_iter().collect();
        self.reply(Response::Success(metadata)).await;
    }
}

fn syntax_error() -> Response {
    Response::Failure(ServerFailure {
        code: "Neo.ClientError.Statement.SyntaxError".to_string(),
        message: "Invalid input".to_string(),
    })
}

#[tokio::test]
async fn handshake_selects_the_newest_common_version() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        let mut opening = [0u8; 20];
        server_io.read_exact(&mut opening).await.unwrap();

        assert_eq!(
            opening,
            [
                0x60, 0x60, 0xB0, 0x17, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00,
                0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00
            ]
        );

        server_io.write_all(&[0, 0, 0, 3]).await.unwrap();
    });

    let session = Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
        .await
        .unwrap();

    assert_eq!(session.version(), ProtocolVersion::V3);
    assert_eq!(session.state(), State::Connected);

    server.await.unwrap();
}

#[tokio::test]
async fn handshake_rejection_raises_an_error() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        let mut opening = [0u8; 20];
        server_io.read_exact(&mut opening).await.unwrap();
        server_io.write_all(&[0, 0, 0, 0]).await.unwrap();
    });

    let result = Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
        .await;

    assert!(matches!(result, Err(Error::Handshake(_))));

    server.await.unwrap();
}

#[tokio::test]
async fn trivial_run_and_pull() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        accept_handshake(&mut server_io, 3).await;
        let mut half = ServerHalf::new(server_io, ProtocolVersion::V3);

        let hello = half.expect("HELLO").await;
        match hello {
            Request::Hello { auth, .. } => assert_eq!(auth, Auth::basic("neo", "pw")),
            other => panic!("unexpected request {other:?}"),
        }
        half.reply_success(vec![("server", Value::from("Neo4j/3.5.14"))])
            .await;

        match half.expect("RUN").await {
            Request::Run { statement, .. } => assert_eq!(statement, "RETURN 1 AS n"),
            other => panic!("unexpected request {other:?}"),
        }
        half.reply_success(vec![("fields", Value::from(vec!["n"]))])
            .await;

        half.expect("PULL_ALL").await;
        half.reply(Response::Record(vec![Value::Int(1)])).await;
        half.reply_success(vec![("type", Value::from("r"))]).await;
    });

    let mut session =
        Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
            .await
            .unwrap();

    let metadata = session.auth(&Auth::basic("neo", "pw")).await.unwrap();
    assert_eq!(metadata.get("server"), Some(&Value::from("Neo4j/3.5.14")));
    assert_eq!(session.state(), State::Ready);

    let handle = session
        .run("RETURN 1 AS n", PairMap::new(), None)
        .await
        .unwrap();
    assert_eq!(handle.fields, vec!["n".to_string()]);
    assert_eq!(session.state(), State::Streaming);

    let (records, summary) = session.pull_all().await.unwrap();
    assert_eq!(records, vec![vec![Value::Int(1)]]);
    assert_eq!(summary.get("type"), Some(&Value::from("r")));
    assert_eq!(session.state(), State::Ready);

    server.await.unwrap();
}

#[tokio::test]
async fn failure_recovery_with_ack_failure_on_v1() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        accept_handshake(&mut server_io, 1).await;
        let mut half = ServerHalf::new(server_io, ProtocolVersion::V1);

        half.expect("INIT").await;
        half.reply_success(vec![]).await;

        half.expect("RUN").await;
        half.reply(syntax_error()).await;

        // pipelined work after a failure is ignored until acknowledged
        half.expect("RUN").await;
        half.reply(Response::Ignored).await;

        half.expect("ACK_FAILURE").await;
        half.reply_success(vec![]).await;

        half.expect("RUN").await;
        half.reply_success(vec![("fields", Value::from(vec!["n"]))])
            .await;
        half.expect("DISCARD_ALL").await;
        half.reply_success(vec![]).await;
    });

    let mut session =
        Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
            .await
            .unwrap();

    assert_eq!(session.version(), ProtocolVersion::V1);
    session.auth(&Auth::None).await.unwrap();

    let failure = session.run("BAD CYPHER", PairMap::new(), None).await;
    match failure {
        Err(Error::Server(x)) => assert_eq!(x.code, "Neo.ClientError.Statement.SyntaxError"),
        other => panic!("expected server failure, got {other:?}"),
    }
    assert_eq!(session.state(), State::Failed);

    let ignored = session.run("RETURN 1", PairMap::new(), None).await;
    assert!(matches!(ignored, Err(Error::Ignored)));
    assert_eq!(session.state(), State::Interrupted);

    session.ack_failure().await.unwrap();
    assert_eq!(session.state(), State::Ready);

    session.run("RETURN 1", PairMap::new(), None).await.unwrap();
    session.discard_all().await.unwrap();
    assert_eq!(session.state(), State::Ready);

    server.await.unwrap();
}

#[tokio::test]
async fn reset_resolves_pipelined_requests_as_ignored() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        accept_handshake(&mut server_io, 3).await;
        let mut half = ServerHalf::new(server_io, ProtocolVersion::V3);

        half.expect("HELLO").await;
        half.reply_success(vec![]).await;

        // the whole pipeline arrives before any response is sent
        half.expect("RUN").await;
        half.expect("PULL_ALL").await;
        half.expect("RESET").await;

        half.reply(Response::Ignored).await;
        half.reply(Response::Ignored).await;
        half.reply_success(vec![]).await;
    });

    let mut session =
        Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
            .await
            .unwrap();

    session.auth(&Auth::None).await.unwrap();

    session
        .send(Request::Run {
            statement: "UNWIND range(1, 1000000) AS n RETURN n".to_string(),
            parameters: PairMap::new(),
            metadata: None,
        })
        .await
        .unwrap();
    session.send(Request::PullAll).await.unwrap();
    assert_eq!(session.outstanding(), 2);

    session.reset().await.unwrap();
    assert_eq!(session.state(), State::Ready);
    assert_eq!(session.outstanding(), 0);

    server.await.unwrap();
}

#[tokio::test]
async fn authentication_failure_is_terminal() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        accept_handshake(&mut server_io, 3).await;
        let mut half = ServerHalf::new(server_io, ProtocolVersion::V3);

        half.expect("HELLO").await;
        half.reply(Response::Failure(ServerFailure {
            code: "Neo.ClientError.Security.Unauthorized".to_string(),
            message: "invalid credentials".to_string(),
        }))
        .await;
    });

    let mut session =
        Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
            .await
            .unwrap();

    let result = session.auth(&Auth::basic("neo", "wrong")).await;

    assert!(matches!(result, Err(Error::Auth(_))));
    assert!(session.is_defunct());

    server.await.unwrap();
}

#[tokio::test]
async fn unsolicited_response_defuncts_the_session() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        accept_handshake(&mut server_io, 3).await;
        let mut half = ServerHalf::new(server_io, ProtocolVersion::V3);

        half.expect("HELLO").await;
        half.reply_success(vec![]).await;

        // a record nobody asked for
        half.reply(Response::Record(vec![Value::Int(42)])).await;
    });

    let mut session =
        Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
            .await
            .unwrap();

    session.auth(&Auth::None).await.unwrap();

    let result = session.recv().await;

    assert!(matches!(result, Err(Error::Protocol(_))));
    assert!(session.is_defunct());

    server.await.unwrap();
}

#[tokio::test]
async fn bookmarks_carry_across_transactions() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        accept_handshake(&mut server_io, 3).await;
        let mut half = ServerHalf::new(server_io, ProtocolVersion::V3);

        half.expect("HELLO").await;
        half.reply_success(vec![]).await;

        match half.expect("BEGIN").await {
            Request::Begin { metadata } => assert!(metadata.bookmarks.is_empty()),
            other => panic!("unexpected request {other:?}"),
        }
        half.reply_success(vec![]).await;

        half.expect("RUN").await;
        half.reply_success(vec![("fields", Value::from(vec!["n"]))])
            .await;
        half.expect("DISCARD_ALL").await;
        half.reply_success(vec![]).await;

        half.expect("COMMIT").await;
        half.reply_success(vec![("bookmark", Value::from("neo4j:bookmark:v1:tx42"))])
            .await;

        // the next transaction must chain onto the committed one
        match half.expect("BEGIN").await {
            Request::Begin { metadata } => {
                assert_eq!(metadata.bookmarks, vec!["neo4j:bookmark:v1:tx42".to_string()])
            }
            other => panic!("unexpected request {other:?}"),
        }
        half.reply_success(vec![]).await;

        half.expect("ROLLBACK").await;
        half.reply_success(vec![]).await;
    });

    let mut session =
        Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
            .await
            .unwrap();

    session.auth(&Auth::None).await.unwrap();

    session.begin(TxMetadata::new()).await.unwrap();
    assert_eq!(session.state(), State::TxReady);

    session.run("CREATE (n:Thing)", PairMap::new(), None).await.unwrap();
    assert_eq!(session.state(), State::TxStreaming);
    session.discard_all().await.unwrap();
    assert_eq!(session.state(), State::TxReady);

    let bookmark = session.commit().await.unwrap();
    assert_eq!(bookmark.as_deref(), Some("neo4j:bookmark:v1:tx42"));
    assert_eq!(session.last_bookmark(), Some("neo4j:bookmark:v1:tx42"));
    assert_eq!(session.state(), State::Ready);

    session.begin(TxMetadata::new()).await.unwrap();
    session.rollback().await.unwrap();
    assert_eq!(session.state(), State::Ready);

    server.await.unwrap();
}

#[tokio::test]
async fn goodbye_is_sent_when_closing_a_v3_session() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        accept_handshake(&mut server_io, 3).await;
        let mut half = ServerHalf::new(server_io, ProtocolVersion::V3);

        half.expect("HELLO").await;
        half.reply_success(vec![]).await;

        half.expect("GOODBYE").await;
    });

    let mut session =
        Session::handshake(client_io, VersionOffer::default(), SessionConfig::default())
            .await
            .unwrap();

    session.auth(&Auth::None).await.unwrap();
    session.close().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn bolt_client_facade_over_loopback_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (bearer, _) = Bearer::accept_tcp(&listener).await.unwrap();
        let mut bearer = bearer;

        let mut opening = [0u8; 20];
        bearer.read_exact(&mut opening).await.unwrap();
        assert_eq!(&opening[..4], &MAGIC);
        bearer.write_all(&[0, 0, 0, 3]).await.unwrap();

        let mut half = ServerHalf::new(bearer, ProtocolVersion::V3);

        half.expect("HELLO").await;
        half.reply_success(vec![("server", Value::from("Neo4j/3.5.14"))])
            .await;

        half.expect("RUN").await;
        half.reply_success(vec![("fields", Value::from(vec!["greeting"]))])
            .await;
        half.expect("PULL_ALL").await;
        half.reply(Response::Record(vec![Value::from("hello")])).await;
        half.reply_success(vec![("type", Value::from("r"))]).await;

        half.expect("GOODBYE").await;
    });

    let mut client = BoltClient::connect(addr, Auth::None).await.unwrap();

    assert_eq!(client.version(), ProtocolVersion::V3);
    assert_eq!(client.server_agent(), Some("Neo4j/3.5.14"));

    let handle = client
        .run("RETURN 'hello' AS greeting", PairMap::new())
        .await
        .unwrap();
    assert_eq!(handle.fields, vec!["greeting".to_string()]);

    let (records, _) = client.pull_all().await.unwrap();
    assert_eq!(records, vec![vec![Value::from("hello")]]);

    client.close().await.unwrap();

    server.await.unwrap();
}
