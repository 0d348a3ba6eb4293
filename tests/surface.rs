// ABOUTME: Public surface checks: factory dispatch, trait-object ergonomics,
// ABOUTME: and error display text callers may match on.

use kivotos::{Client, Cmd, Config, Containerd, Docker, Error, ExitError};

fn lazy_channel() -> tonic::transport::Channel {
    tonic::transport::Endpoint::from_static("http://[::1]:50051").connect_lazy()
}

#[test]
fn cmd_trait_objects_are_send() {
    fn assert_send<T: Send>() {}
    assert_send::<Box<dyn Cmd>>();
}

#[test]
fn docker_clients_convert_into_the_client_enum() {
    let docker = Docker::connect_unix("/var/run/docker.sock", 5).expect("client construction");
    let client: Client = docker.into();
    assert!(matches!(client, Client::Docker(_)));
}

#[test]
fn containerd_clients_convert_into_the_client_enum() {
    let containerd = Containerd::new(lazy_channel(), "production");
    assert_eq!(containerd.default_namespace(), "production");
    let client: Client = containerd.into();
    assert!(matches!(client, Client::Containerd(_)));
}

#[test]
fn factory_builds_commands_for_both_runtimes() {
    let docker = Docker::connect_unix("/var/run/docker.sock", 5).expect("client construction");
    let cmd = kivotos::command(docker, Config::default());
    assert_eq!(cmd.pid(), "");

    let containerd = Containerd::new(lazy_channel(), "production");
    let cmd = kivotos::command(containerd, Config::default());
    assert_eq!(cmd.pid(), "");
}

#[test]
#[should_panic(expected = "default namespace")]
fn factory_panics_on_empty_containerd_namespace() {
    let containerd = Containerd::new(lazy_channel(), "");
    let _ = kivotos::command(containerd, Config::default());
}

#[test]
fn misuse_errors_read_naturally() {
    assert_eq!(Error::AlreadyStarted.to_string(), "command already started");
    assert_eq!(Error::NotStarted.to_string(), "command not started");
    assert_eq!(Error::StdoutAlreadySet.to_string(), "stdout already set");
    assert_eq!(Error::NotCreated.to_string(), "container not created");
}

#[test]
fn exit_errors_expose_code_and_captured_stderr() {
    let exit = ExitError {
        code: 7,
        stderr: Some(b"boom".to_vec()),
    };
    assert_eq!(exit.to_string(), "exit status 7");

    let err: Error = exit.into();
    match err {
        Error::Exit(exit) => {
            assert_eq!(exit.code, 7);
            assert_eq!(exit.stderr.as_deref(), Some(b"boom".as_slice()));
        }
        other => panic!("unexpected error {other:?}"),
    }
}
