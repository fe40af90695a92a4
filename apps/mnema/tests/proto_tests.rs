//! Integration tests for the wire protocol: round-trips against a live
//! server on an ephemeral port.

#![allow(clippy::unwrap_used, clippy::panic)]

use mnema::net::proto::{
    CMD_CHECK_ELEMENT, CMD_CREATE_LINK, CMD_CREATE_NODE, CMD_ERASE_ELEMENT, CMD_FIND_LINKS,
    CMD_GET_ELEMENT_TYPE, CMD_GET_LINK_CONTENT, CMD_SET_LINK_CONTENT, CMD_SET_SYSIDTF,
    CMD_SHUTDOWN, RESULT_FAIL, RESULT_OK, RequestHeader, ResponseHeader, push_addr,
};
use mnema::net::run_server;
use mnema_core::{Addr, Memory, Params, TypeMask};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

struct TestServer {
    _dir: tempfile::TempDir,
    address: std::net::SocketAddr,
    handle: tokio::task::JoinHandle<Result<(), mnema_core::MnemaError>>,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(Params {
        repo_path: dir.path().to_path_buf(),
        ..Params::default()
    })
    .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let handle = tokio::spawn(run_server(listener, Arc::clone(&memory)));
    TestServer {
        _dir: dir,
        address,
        handle,
    }
}

async fn send_command(
    stream: &mut TcpStream,
    cmd: u8,
    id: u32,
    params: &[u8],
) -> (ResponseHeader, Vec<u8>) {
    let header = RequestHeader {
        cmd,
        flags: 0,
        id,
        param_size: params.len() as u32,
    };
    stream.write_all(&header.encode()).await.unwrap();
    stream.write_all(params).await.unwrap();

    let mut response = [0u8; ResponseHeader::SIZE];
    stream.read_exact(&mut response).await.unwrap();
    let response = ResponseHeader::decode(&response);
    let mut body = vec![0u8; response.result_size as usize];
    stream.read_exact(&mut body).await.unwrap();
    (response, body)
}

fn addr_from_body(body: &[u8]) -> Addr {
    assert_eq!(body.len(), 4);
    Addr::new(
        u16::from_le_bytes([body[0], body[1]]),
        u16::from_le_bytes([body[2], body[3]]),
    )
}

// =============================================================================
// ROUND TRIPS
// =============================================================================

#[tokio::test]
async fn create_inspect_erase_round_trip() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.address).await.unwrap();
    let node_type = TypeMask::NODE_CONST.bits();

    // Create a const node.
    let (response, body) =
        send_command(&mut stream, CMD_CREATE_NODE, 1, &node_type.to_le_bytes()).await;
    assert_eq!(response.result, RESULT_OK);
    assert_eq!(response.cmd, CMD_CREATE_NODE);
    assert_eq!(response.id, 1);
    let addr = addr_from_body(&body);
    assert!(addr.is_valid());

    // Its type echoes back.
    let mut params = Vec::new();
    push_addr(&mut params, addr);
    let (response, body) = send_command(&mut stream, CMD_GET_ELEMENT_TYPE, 2, &params).await;
    assert_eq!(response.result, RESULT_OK);
    assert_eq!(u16::from_le_bytes([body[0], body[1]]), node_type);

    // It exists, then it does not.
    let (response, _) = send_command(&mut stream, CMD_CHECK_ELEMENT, 3, &params).await;
    assert_eq!(response.result, RESULT_OK);
    let (response, _) = send_command(&mut stream, CMD_ERASE_ELEMENT, 4, &params).await;
    assert_eq!(response.result, RESULT_OK);
    let (response, _) = send_command(&mut stream, CMD_CHECK_ELEMENT, 5, &params).await;
    assert_eq!(response.result, RESULT_FAIL);

    server.handle.abort();
}

#[tokio::test]
async fn link_content_round_trip_and_search() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.address).await.unwrap();

    let (response, body) = send_command(&mut stream, CMD_CREATE_LINK, 1, &[]).await;
    assert_eq!(response.result, RESULT_OK);
    let link = addr_from_body(&body);

    // Set content.
    let content = b"remote content";
    let mut params = Vec::new();
    push_addr(&mut params, link);
    params.extend_from_slice(&(content.len() as u32).to_le_bytes());
    params.extend_from_slice(content);
    let (response, _) = send_command(&mut stream, CMD_SET_LINK_CONTENT, 2, &params).await;
    assert_eq!(response.result, RESULT_OK);

    // Read it back; the body is the raw content.
    let mut params = Vec::new();
    push_addr(&mut params, link);
    let (response, body) = send_command(&mut stream, CMD_GET_LINK_CONTENT, 3, &params).await;
    assert_eq!(response.result, RESULT_OK);
    assert_eq!(body, content);

    // Find it by exact content.
    let mut params = Vec::new();
    params.extend_from_slice(&(content.len() as u32).to_le_bytes());
    params.extend_from_slice(content);
    let (response, body) = send_command(&mut stream, CMD_FIND_LINKS, 4, &params).await;
    assert_eq!(response.result, RESULT_OK);
    assert_eq!(u32::from_le_bytes([body[0], body[1], body[2], body[3]]), 1);
    assert_eq!(addr_from_body(&body[4..]), link);

    server.handle.abort();
}

#[tokio::test]
async fn system_identifier_binds_over_the_wire() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.address).await.unwrap();

    let (_, body) = send_command(
        &mut stream,
        CMD_CREATE_NODE,
        1,
        &TypeMask::NODE_CONST_CLASS.bits().to_le_bytes(),
    )
    .await;
    let node = addr_from_body(&body);

    let identifier = b"wire_bound_concept";
    let mut params = Vec::new();
    push_addr(&mut params, node);
    params.extend_from_slice(&(identifier.len() as u32).to_le_bytes());
    params.extend_from_slice(identifier);
    let (response, _) = send_command(&mut stream, CMD_SET_SYSIDTF, 2, &params).await;
    assert_eq!(response.result, RESULT_OK);

    let mut params = Vec::new();
    params.extend_from_slice(&(identifier.len() as u32).to_le_bytes());
    params.extend_from_slice(identifier);
    let (response, body) = send_command(
        &mut stream,
        mnema::net::proto::CMD_FIND_ELEMENT_BY_SYSIDTF,
        3,
        &params,
    )
    .await;
    assert_eq!(response.result, RESULT_OK);
    assert_eq!(addr_from_body(&body), node);

    server.handle.abort();
}

// =============================================================================
// FAILURE PATHS
// =============================================================================

#[tokio::test]
async fn failed_commands_keep_the_connection_open() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.address).await.unwrap();

    // Unknown command code.
    let (response, body) = send_command(&mut stream, 0x77, 1, &[]).await;
    assert_eq!(response.result, RESULT_FAIL);
    assert!(body.is_empty());

    // Dead addr.
    let mut params = Vec::new();
    push_addr(&mut params, Addr::new(20, 20));
    let (response, _) = send_command(&mut stream, CMD_GET_ELEMENT_TYPE, 2, &params).await;
    assert_eq!(response.result, RESULT_FAIL);

    // Truncated params.
    let (response, _) = send_command(&mut stream, CMD_GET_ELEMENT_TYPE, 3, &[1]).await;
    assert_eq!(response.result, RESULT_FAIL);

    // Malformed type mask.
    let bad_mask = 0xFFFFu16;
    let (response, _) =
        send_command(&mut stream, CMD_CREATE_NODE, 4, &bad_mask.to_le_bytes()).await;
    assert_eq!(response.result, RESULT_FAIL);

    // The connection still serves valid commands.
    let (response, _) = send_command(
        &mut stream,
        CMD_CREATE_NODE,
        5,
        &TypeMask::NODE_CONST.bits().to_le_bytes(),
    )
    .await;
    assert_eq!(response.result, RESULT_OK);

    server.handle.abort();
}

#[tokio::test]
async fn shutdown_command_stops_the_server() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.address).await.unwrap();

    let (response, _) = send_command(&mut stream, CMD_SHUTDOWN, 1, &[]).await;
    assert_eq!(response.result, RESULT_OK);

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), server.handle)
        .await
        .expect("server should stop")
        .expect("task should join");
    assert!(outcome.is_ok());
}
