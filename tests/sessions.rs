//! End-to-end exercises of the session protocol with both roles running
//! in-process: the control handshake, fixed stream order, forwards in both
//! directions, and the SOCKS5 front end, over an in-memory connection with
//! real TCP targets on loopback.

use {
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    },
    tokio_util::sync::CancellationToken,
    zeekat::{
        master,
        protocol::{self, socks, Handshake, Resize, StreamHeader},
        session::{Mode, Session},
        slave,
    },
};

fn session_pair() -> (Session, Session) {
    let (master_io, slave_io) = tokio::io::duplex(64 * 1024);
    (
        Session::new(master_io, Mode::Client),
        Session::new(slave_io, Mode::Server),
    )
}

/// A loopback server that writes `payload`, echoes one request back, and
/// closes. Returns the bound port.
async fn payload_server(payload: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        conn.write_all(payload).await.unwrap();
        conn.shutdown().await.unwrap();
        let mut sink = Vec::new();
        conn.read_to_end(&mut sink).await.ok();
    });
    port
}

#[tokio::test]
async fn handshake_and_fixed_streams_line_up() {
    let (mut master_io, mut slave_io) = tokio::io::duplex(64 * 1024);

    let sent = Handshake {
        exec: String::new(),
        pty: true,
        log: true,
        local_forwards: vec![],
        remote_forwards: vec![],
        socks: None,
    };
    protocol::write_frame(&mut master_io, &sent).await.unwrap();
    let received: Handshake = protocol::read_frame(&mut slave_io).await.unwrap();
    assert_eq!(sent, received);

    // Handshake consumed exactly; the multiplexer takes over the same pipe.
    let mut master = Session::new(master_io, Mode::Client);
    let mut slave = Session::new(slave_io, Mode::Server);

    let mut main_stream = master.open_stream().await.unwrap();
    let mut resize_stream = master.open_stream().await.unwrap();
    let mut log_stream = master.open_stream().await.unwrap();

    main_stream.write_all(b"main").await.unwrap();
    main_stream.flush().await.unwrap();
    protocol::write_frame(&mut resize_stream, &Resize { rows: 50, cols: 160 })
        .await
        .unwrap();
    log_stream.write_all(b"log").await.unwrap();
    log_stream.flush().await.unwrap();

    // The slave sees them in open order: main, resize, log.
    let mut accepted_main = slave.accept_stream().await.unwrap();
    let mut buf = [0u8; 4];
    accepted_main.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"main");

    let mut accepted_resize = slave.accept_stream().await.unwrap();
    let size: Resize = protocol::read_frame(&mut accepted_resize).await.unwrap();
    assert_eq!(size, Resize { rows: 50, cols: 160 });

    let mut accepted_log = slave.accept_stream().await.unwrap();
    let mut buf = [0u8; 3];
    accepted_log.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"log");
}

#[tokio::test]
async fn local_forward_delivers_target_payload() {
    let (mut master, mut slave) = session_pair();
    let cancel = CancellationToken::new();
    let target_port = payload_server(b"PAYLOAD").await;

    let dispatcher = tokio::spawn(slave::dispatch::serve(
        slave.take_incoming(),
        cancel.clone(),
    ));

    // What the master's forward listener does for each accepted client.
    let mut stream = master.open_stream().await.unwrap();
    protocol::write_header(
        &mut stream,
        &StreamHeader::LocalForward {
            host: "127.0.0.1".to_string(),
            port: target_port,
        },
    )
    .await
    .unwrap();

    let mut delivered = Vec::new();
    stream.read_to_end(&mut delivered).await.unwrap();
    assert_eq!(delivered, b"PAYLOAD");

    cancel.cancel();
    dispatcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn local_forward_dial_failure_reads_as_immediate_eof() {
    let (mut master, mut slave) = session_pair();
    let cancel = CancellationToken::new();

    // Grab a port that is certainly closed by binding and dropping it.
    let closed_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    tokio::spawn(slave::dispatch::serve(slave.take_incoming(), cancel.clone()));

    let mut stream = master.open_stream().await.unwrap();
    protocol::write_header(
        &mut stream,
        &StreamHeader::LocalForward {
            host: "127.0.0.1".to_string(),
            port: closed_port,
        },
    )
    .await
    .unwrap();

    let mut delivered = Vec::new();
    stream.read_to_end(&mut delivered).await.unwrap();
    assert!(delivered.is_empty());
}

#[tokio::test]
async fn remote_forward_streams_flow_backwards() {
    let (mut master, mut slave) = session_pair();
    let cancel = CancellationToken::new();
    let target_port = payload_server(b"BACKWARDS").await;

    let acceptor = tokio::spawn(master::forward::serve_remote(
        master.take_incoming(),
        cancel.clone(),
    ));

    // What the slave's remote listener does for each accepted connection.
    let mut stream = slave.open_stream().await.unwrap();
    protocol::write_header(
        &mut stream,
        &StreamHeader::RemoteForward {
            host: "127.0.0.1".to_string(),
            port: target_port,
        },
    )
    .await
    .unwrap();

    let mut delivered = Vec::new();
    stream.read_to_end(&mut delivered).await.unwrap();
    assert_eq!(delivered, b"BACKWARDS");

    cancel.cancel();
    acceptor.await.unwrap().unwrap();
}

#[tokio::test]
async fn socks_connect_is_transparent_end_to_end() {
    let (mut master, mut slave) = session_pair();
    let cancel = CancellationToken::new();
    let target_port = payload_server(b"THROUGH").await;

    tokio::spawn(slave::dispatch::serve(slave.take_incoming(), cancel.clone()));

    let (mut client, proxy_side) = tokio::io::duplex(16 * 1024);
    let server = tokio::spawn(master::socks::serve_client(
        proxy_side,
        master.opener(),
        cancel.clone(),
    ));

    // Greeting: offer no-auth only.
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut chosen = [0u8; 2];
    client.read_exact(&mut chosen).await.unwrap();
    assert_eq!(chosen, [0x05, 0x00]);

    // CONNECT 127.0.0.1:target_port over ATYP=IPv4.
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&target_port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    // The tunnel is byte-transparent.
    let mut delivered = [0u8; 7];
    client.read_exact(&mut delivered).await.unwrap();
    assert_eq!(&delivered, b"THROUGH");

    drop(client);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn socks_rejects_unsupported_commands_without_opening_streams() {
    let (mut master, mut slave) = session_pair();
    let cancel = CancellationToken::new();

    let (mut client, proxy_side) = tokio::io::duplex(16 * 1024);
    let server = tokio::spawn(master::socks::serve_client(
        proxy_side,
        master.opener(),
        cancel.clone(),
    ));

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut chosen = [0u8; 2];
    client.read_exact(&mut chosen).await.unwrap();
    assert_eq!(chosen, [0x05, 0x00]);

    // BIND is not supported.
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], socks::REP_COMMAND_NOT_SUPPORTED);

    server.await.unwrap().unwrap();

    // No stream ever reached the slave: once the master side closes, the
    // inbound queue ends without having produced anything.
    let mut incoming = slave.take_incoming();
    master.close().await.unwrap();
    assert!(incoming.next().await.is_none());
}

#[tokio::test]
async fn socks_maps_refused_dials_to_the_right_reply() {
    let (mut master, mut slave) = session_pair();
    let cancel = CancellationToken::new();

    let closed_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    tokio::spawn(slave::dispatch::serve(slave.take_incoming(), cancel.clone()));

    let (mut client, proxy_side) = tokio::io::duplex(16 * 1024);
    tokio::spawn(master::socks::serve_client(
        proxy_side,
        master.opener(),
        cancel.clone(),
    ));

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut chosen = [0u8; 2];
    client.read_exact(&mut chosen).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&closed_port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], socks::REP_CONNECTION_REFUSED);
}

#[cfg(unix)]
#[tokio::test]
async fn exec_bridges_a_program_until_it_exits() {
    let (mut master, mut slave) = session_pair();
    let cancel = CancellationToken::new();

    let handshake = Handshake {
        exec: "cat".to_string(),
        pty: false,
        log: false,
        local_forwards: vec![],
        remote_forwards: vec![],
        socks: None,
    };

    let mut main_stream = master.open_stream().await.unwrap();
    let accepted = slave.accept_stream().await.unwrap();
    let foreground = tokio::spawn(zeekat::slave::exec::run(
        accepted,
        handshake,
        None,
        None,
        cancel.clone(),
    ));

    // cat echoes what the master types.
    main_stream.write_all(b"through cat\n").await.unwrap();
    main_stream.flush().await.unwrap();
    let mut echoed = [0u8; 12];
    main_stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"through cat\n");

    // Closing the master's write half reaches cat as stdin EOF; the
    // program exits and the foreground job finishes with it.
    main_stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    main_stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    foreground.await.unwrap().unwrap();
}

#[tokio::test]
async fn full_session_over_loopback_tcp() {
    // The two roles meet over real TCP on an ephemeral port, with the
    // connect/listen plumbing driven directly.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let slave_side = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        let mut conn = conn;
        let handshake: Handshake = protocol::read_frame(&mut conn).await.unwrap();
        assert!(handshake.exec.is_empty());
        let mut session = Session::new(conn, Mode::Server);
        let mut main_stream = session.accept_stream().await.unwrap();

        // Echo one line back, netcat-style.
        let mut line = [0u8; 6];
        main_stream.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"hello\n");
        main_stream.write_all(b"hi\n").await.unwrap();
        main_stream.flush().await.unwrap();
        main_stream.shutdown().await.unwrap();
        // Hold the session open until the master has drained everything;
        // dropping it early would tear the connection down under the FIN.
        let mut sink = Vec::new();
        main_stream.read_to_end(&mut sink).await.unwrap();
    });

    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    protocol::write_frame(
        &mut conn,
        &Handshake {
            exec: String::new(),
            pty: false,
            log: false,
            local_forwards: vec![],
            remote_forwards: vec![],
            socks: None,
        },
    )
    .await
    .unwrap();
    let mut session = Session::new(conn, Mode::Client);
    let mut main_stream = session.open_stream().await.unwrap();
    main_stream.write_all(b"hello\n").await.unwrap();
    main_stream.flush().await.unwrap();

    let mut reply = Vec::new();
    main_stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"hi\n");
    main_stream.shutdown().await.unwrap();

    slave_side.await.unwrap();
}
