//! End-to-end scenarios driving a real [`Server`] against the `fixture-compiler` subprocess:
//! cold compile, the up-to-date short-circuit, watcher-triggered recompiles with broadcast,
//! compiler-version invalidation, forced recompiles, and packaging closure expansion.

use std::{
    io::BufReader,
    net::TcpStream,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use resource_build_server::{
    config::Config,
    id::{ResourceId, ResourcePath, ResourceTypeId},
    ipc::{message::WireStatus, Message},
    registry::{CompilerRegistry, ExternalCompiler, STANDARD_RESOURCE_TYPES},
    request::RequestOrigin,
    server::Server,
};

fn fixture_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fixture-compiler"))
}

fn write_config(dir: &Path) -> Config {
    let raw = dir.join("raw");
    let compiled = dir.join("compiled");
    std::fs::create_dir_all(&raw).unwrap();
    std::fs::create_dir_all(&compiled).unwrap();
    let ini_path = dir.join("ResourceServer.ini");
    std::fs::write(
        &ini_path,
        format!(
            "resource_server_address = 127.0.0.1\n\
             resource_server_port = 0\n\
             raw_resource_path = {}\n\
             compiled_resource_path = {}\n\
             worker_binary_path = {}\n\
             max_simultaneous_compilation_tasks = 2\n\
             compiled_record_db_path = {}\n",
            raw.display(),
            compiled.display(),
            fixture_bin().display(),
            compiled.join("records.json").display(),
        ),
    )
    .unwrap();
    Config::load(&ini_path).unwrap()
}

fn registry_with_version(version: i32) -> CompilerRegistry {
    let mut registry = CompilerRegistry::new();
    registry.register(Arc::new(ExternalCompiler::new(
        "fixture-compiler",
        version,
        STANDARD_RESOURCE_TYPES.to_vec(),
        true,
        fixture_bin(),
    )));
    registry
}

fn id(tag: &[u8], relative: &str) -> ResourceId {
    ResourceId::new(ResourceTypeId::new(tag), ResourcePath::from_relative(relative))
}

fn connect(server: &Server) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(server.ipc_local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
    BufReader::new(stream)
}

fn send(reader: &mut BufReader<TcpStream>, message: &Message) {
    use std::io::Write;
    reader.get_mut().write_all(&message.encode()).unwrap();
}

/// Ticks `server` and drains `reader` until a `ResourceRequestComplete` for `target` arrives,
/// or `deadline` elapses.
fn wait_for_complete(
    server: &mut Server,
    reader: &mut BufReader<TcpStream>,
    target: &ResourceId,
    deadline: Duration,
) -> (WireStatus, String) {
    let start = Instant::now();
    loop {
        server.tick();
        if let Ok(Some(Message::ResourceRequestComplete { resource_id, status, compiled_path })) =
            Message::read_from(&mut *reader)
        {
            if &resource_id == target {
                return (status, compiled_path);
            }
        }
        if start.elapsed() > deadline {
            panic!("timed out waiting for completion of {target}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn wait_for_broadcast(
    server: &mut Server,
    reader: &mut BufReader<TcpStream>,
    target: &ResourceId,
    deadline: Duration,
) {
    let start = Instant::now();
    loop {
        server.tick();
        if let Ok(Some(Message::ResourceUpdated(resource_id))) = Message::read_from(&mut *reader) {
            if &resource_id == target {
                return;
            }
        }
        if start.elapsed() > deadline {
            panic!("timed out waiting for a watcher broadcast for {target}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn wait_until(server: &mut Server, mut pred: impl FnMut(&mut Server) -> bool, deadline: Duration) {
    let start = Instant::now();
    loop {
        server.tick();
        if pred(server) {
            return;
        }
        if start.elapsed() > deadline {
            panic!("condition never became true");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn s1_cold_compile_produces_a_compiled_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("raw/a.msh"), b"geometry").unwrap();

    let mut server = Server::start(&config, registry_with_version(1)).unwrap();
    let mut client = connect(&server);
    let resource = id(b"msh", "a.msh");
    send(&mut client, &Message::RequestResource(resource.clone()));

    let (status, compiled_path) =
        wait_for_complete(&mut server, &mut client, &resource, Duration::from_secs(5));
    assert_eq!(status, WireStatus::Succeeded);
    assert!(Path::new(&compiled_path).is_file());
}

#[test]
fn s2_second_request_short_circuits_as_up_to_date() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("raw/a.msh"), b"geometry").unwrap();

    let mut server = Server::start(&config, registry_with_version(1)).unwrap();
    let mut client = connect(&server);
    let resource = id(b"msh", "a.msh");

    send(&mut client, &Message::RequestResource(resource.clone()));
    let (first, _) = wait_for_complete(&mut server, &mut client, &resource, Duration::from_secs(5));
    assert_eq!(first, WireStatus::Succeeded);

    send(&mut client, &Message::RequestResource(resource.clone()));
    let (second, _) = wait_for_complete(&mut server, &mut client, &resource, Duration::from_secs(5));
    assert_eq!(second, WireStatus::SucceededUpToDate);
}

#[test]
fn s3_editing_the_source_triggers_a_watcher_recompile_and_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let source = dir.path().join("raw/watched.msh");
    std::fs::write(&source, b"v1").unwrap();

    let mut server = Server::start(&config, registry_with_version(1)).unwrap();
    let resource = id(b"msh", "watched.msh");

    let mut requester = connect(&server);
    send(&mut requester, &Message::RequestResource(resource.clone()));
    let (status, _) =
        wait_for_complete(&mut server, &mut requester, &resource, Duration::from_secs(5));
    assert_eq!(status, WireStatus::Succeeded);

    let mut observer = connect(&server);

    std::thread::sleep(Duration::from_millis(50));
    std::fs::write(&source, b"v2, edited").unwrap();

    wait_for_broadcast(&mut server, &mut observer, &resource, Duration::from_secs(5));
}

#[test]
fn s4_compiler_version_bump_invalidates_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("raw/a.msh"), b"version=1\n").unwrap();
    let resource = id(b"msh", "a.msh");

    {
        let mut server = Server::start(&config, registry_with_version(1)).unwrap();
        let mut client = connect(&server);
        send(&mut client, &Message::RequestResource(resource.clone()));
        let (status, _) =
            wait_for_complete(&mut server, &mut client, &resource, Duration::from_secs(5));
        assert_eq!(status, WireStatus::Succeeded);
    }

    std::fs::write(dir.path().join("raw/a.msh"), b"version=2\n").unwrap();

    let mut server = Server::start(&config, registry_with_version(2)).unwrap();
    let mut client = connect(&server);
    send(&mut client, &Message::RequestResource(resource.clone()));
    let (status, _) = wait_for_complete(&mut server, &mut client, &resource, Duration::from_secs(5));
    assert_eq!(status, WireStatus::Succeeded, "version bump must force a real recompile, not a cache hit");
}

#[test]
fn s5_manual_forced_recompile_skips_the_up_to_date_check() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("raw/a.msh"), b"geometry").unwrap();
    let resource = id(b"msh", "a.msh");

    let mut server = Server::start(&config, registry_with_version(1)).unwrap();
    let mut client = connect(&server);
    send(&mut client, &Message::RequestResource(resource.clone()));
    let (first, _) = wait_for_complete(&mut server, &mut client, &resource, Duration::from_secs(5));
    assert_eq!(first, WireStatus::Succeeded);

    server.scheduler_mut().create_request(resource.clone(), 0, RequestOrigin::ManualCompileForced);
    wait_until(
        &mut server,
        |server| server.scheduler().completed().iter().filter(|r| r.resource_id == resource).count() >= 2,
        Duration::from_secs(5),
    );

    let forced = server
        .scheduler()
        .completed()
        .iter()
        .rev()
        .find(|r| r.resource_id == resource)
        .expect("forced request should be in the completed history");
    assert!(forced.log().contains("forced recompilation requested"));
}

#[test]
fn s6_packaging_expands_and_compiles_the_install_closure() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(
        dir.path().join("raw/level.map"),
        b"dep=msh:data://a.msh\ndep=tex:data://b.tex\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("raw/a.msh"), b"geometry").unwrap();
    std::fs::write(dir.path().join("raw/b.tex"), b"pixels").unwrap();

    let map = id(b"map", "level.map");
    let mesh = id(b"msh", "a.msh");
    let texture = id(b"tex", "b.tex");

    let mut server = Server::start(&config, registry_with_version(1)).unwrap();
    let mut client = connect(&server);

    // Compile the map once up front so its header declares the install-dependencies the
    // packaging sweep below discovers.
    send(&mut client, &Message::RequestResource(map.clone()));
    let (status, _) = wait_for_complete(&mut server, &mut client, &map, Duration::from_secs(5));
    assert_eq!(status, WireStatus::Succeeded);

    assert!(server.scheduler_mut().start_packaging(vec![map.clone()]));
    wait_until(&mut server, |server| !server.scheduler().is_packaging(), Duration::from_secs(10));

    assert_eq!(server.scheduler().packaging_progress(), Some(1.0));
    assert!(dir.path().join("compiled/level.map").is_file());
    assert!(dir.path().join("compiled/a.msh").is_file());
    assert!(dir.path().join("compiled/b.tex").is_file());
    let _ = (mesh, texture);
}
