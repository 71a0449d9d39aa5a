#[path = "common/mod.rs"]
mod common;

use std::net::{SocketAddr, TcpListener};

use carpool::{
    bootstrap::{BootstrapState, publish},
    directory::{DirectoryClient, DirectoryError, DirectoryServer},
    error::BootstrapError,
};
use common::free_port;

fn live_endpoint() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").expect("failed to bind endpoint")
}

fn addr(listener: &TcpListener) -> SocketAddr {
    listener.local_addr().expect("failed to read endpoint address")
}

#[test]
fn creates_a_directory_when_none_is_listening() {
    let port = free_port();
    let endpoint = live_endpoint();

    let publication = publish(port, "svc", addr(&endpoint)).expect("publish failed");
    assert_eq!(publication.state(), BootstrapState::Create);
    assert_eq!(publication.directory_addr().port(), port);

    let client = DirectoryClient::new(port);
    assert_eq!(client.lookup("svc").expect("lookup failed"), addr(&endpoint));

    publication.withdraw();
    assert!(matches!(
        client.lookup("svc"),
        Err(DirectoryError::Unreachable { .. })
    ));
}

#[test]
fn attaches_to_an_existing_directory() {
    let directory = DirectoryServer::spawn(free_port()).expect("directory failed to start");
    let port = directory.local_addr().port();
    let endpoint = live_endpoint();

    let publication = publish(port, "svc", addr(&endpoint)).expect("publish failed");
    assert_eq!(publication.state(), BootstrapState::Attach);
    assert_eq!(directory.bindings().lookup("svc").ok(), Some(addr(&endpoint)));

    // Withdrawing an attached publication leaves the directory running.
    publication.withdraw();
    let client = DirectoryClient::new(port);
    assert!(matches!(client.lookup("svc"), Err(DirectoryError::NotBound(_))));
    assert!(client.list().expect("list failed").is_empty());
}

#[test]
fn live_binding_is_fatal() {
    let directory = DirectoryServer::spawn(free_port()).expect("directory failed to start");
    let port = directory.local_addr().port();
    let first = live_endpoint();
    let second = live_endpoint();

    let _publication = publish(port, "svc", addr(&first)).expect("first publish failed");
    let err = publish(port, "svc", addr(&second)).unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::AlreadyBound { ref name, port: p } if name == "svc" && p == port
    ));
    assert_eq!(directory.bindings().lookup("svc").ok(), Some(addr(&first)));
}

#[test]
fn stale_binding_is_replaced() {
    let directory = DirectoryServer::spawn(free_port()).expect("directory failed to start");
    let port = directory.local_addr().port();

    let dead = {
        let listener = live_endpoint();
        addr(&listener)
    };
    DirectoryClient::new(port)
        .bind("svc", dead)
        .expect("initial bind failed");

    let endpoint = live_endpoint();
    let publication = publish(port, "svc", addr(&endpoint)).expect("publish failed");

    assert_eq!(publication.state(), BootstrapState::Attach);
    assert_eq!(directory.bindings().lookup("svc").ok(), Some(addr(&endpoint)));
}

#[test]
fn rebinding_the_same_endpoint_is_accepted() {
    let directory = DirectoryServer::spawn(free_port()).expect("directory failed to start");
    let client = DirectoryClient::new(directory.local_addr().port());
    let endpoint = live_endpoint();

    client.bind("svc", addr(&endpoint)).expect("first bind failed");
    client.bind("svc", addr(&endpoint)).expect("second bind failed");
    assert_eq!(client.list().expect("list failed"), vec!["svc".to_string()]);
}
