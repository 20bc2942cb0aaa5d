//! Drives `Engine::connect` and `ControlSocket::list` against a minimal mock
//! FTP server speaking the real wire protocol over loopback TCP, exercising
//! the logon handshake and a passive-mode `LIST -a` round trip end to end.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ftpc_engine::notification::EventMeta;
use ftpc_engine::{Credentials, Engine, EngineOptions, Notification, NotificationListener, Protocol, Server, ServerPath};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Default)]
struct RecordingListener {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl NotificationListener for RecordingListener {
    async fn receive(&self, event: Notification, _meta: EventMeta) {
        if let Notification::DirectoryListingChanged { listing: Some(listing), .. } = event {
            self.log.lock().unwrap().push(format!("listing:{}", listing.entries.len()));
        }
    }
}

async fn read_command<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("mock server: read command");
    line.trim_end_matches(['\r', '\n']).to_string()
}

async fn write_reply<W: AsyncWriteExt + Unpin>(writer: &mut W, text: &str) {
    writer.write_all(text.as_bytes()).await.expect("mock server: write reply");
    writer.write_all(b"\r\n").await.expect("mock server: write crlf");
}

#[tokio::test]
async fn connect_and_list_round_trips_through_a_mock_server() {
    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control_listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (control_stream, _) = control_listener.accept().await.unwrap();
        let (read_half, mut write_half) = control_stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_reply(&mut write_half, "220 mock ftp ready").await;
        assert_eq!(read_command(&mut reader).await, "USER anonymous");
        write_reply(&mut write_half, "331 need password").await;
        assert_eq!(read_command(&mut reader).await, "PASS anonymous@");
        write_reply(&mut write_half, "230 logged in").await;
        assert_eq!(read_command(&mut reader).await, "SYST");
        write_reply(&mut write_half, "215 UNIX Type: L8").await;
        assert_eq!(read_command(&mut reader).await, "FEAT");
        write_reply(&mut write_half, "502 feat not implemented").await;

        assert_eq!(read_command(&mut reader).await, "CWD /");
        write_reply(&mut write_half, "250 directory changed").await;
        assert_eq!(read_command(&mut reader).await, "PWD");
        write_reply(&mut write_half, "257 \"/\" is current directory").await;

        assert_eq!(read_command(&mut reader).await, "TYPE I");
        write_reply(&mut write_half, "200 type set to I").await;
        assert_eq!(read_command(&mut reader).await, "PASV");

        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_addr = data_listener.local_addr().unwrap();
        let IpAddr::V4(data_ip) = data_addr.ip() else { unreachable!("bound to an IPv4 loopback address") };
        let octets = data_ip.octets();
        let port = data_addr.port();
        write_reply(
            &mut write_half,
            &format!("227 Entering Passive Mode ({},{},{},{},{},{})", octets[0], octets[1], octets[2], octets[3], port >> 8, port & 0xff),
        )
        .await;

        assert_eq!(read_command(&mut reader).await, "LIST -a");
        write_reply(&mut write_half, "150 opening data connection for file list").await;
        let (mut data_stream, _) = data_listener.accept().await.unwrap();
        data_stream.write_all(b"drwxr-xr-x 2 owner group 4096 Jan 1 00:00 sub\r\n").await.unwrap();
        drop(data_stream);
        write_reply(&mut write_half, "226 transfer complete").await;

        assert_eq!(read_command(&mut reader).await, "MDTM sub");
        write_reply(&mut write_half, "213 20230615120000").await;
    });

    let engine = Engine::new();
    let server = Server::new("127.0.0.1", control_addr.port(), Protocol::Ftp);
    let credentials = Credentials::anonymous();
    let listener = RecordingListener::default();
    let log = listener.log.clone();

    let (socket, connect_status) = tokio::time::timeout(Duration::from_secs(5), engine.connect(server, credentials, EngineOptions::default(), listener))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert!(connect_status.is_ok());

    let list_status = tokio::time::timeout(Duration::from_secs(5), socket.list(ServerPath::empty()))
        .await
        .expect("list timed out")
        .expect("list failed");
    assert!(list_status.is_ok());

    assert!(log.lock().unwrap().iter().any(|entry| entry == "listing:1"));

    tokio::time::timeout(Duration::from_secs(5), server_task).await.expect("mock server timed out").expect("mock server task panicked");
}
