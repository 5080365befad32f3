mod common;

use {
    common::{key_files, ServerProcess, SYNTAX_ERROR},
    offload::{framed::FramedChannel, CHUNK_SIZE},
    std::{fs, net::TcpStream, thread},
};

type Channel = FramedChannel<TcpStream>;

/// Upload `source` in chunks and collect the answer.
fn compile(client: &mut Channel, source: &[u8]) -> Option<Vec<u8>> {
    let chunks: Vec<&[u8]> = source.chunks(CHUNK_SIZE).collect();
    client.send_string("compile").unwrap();
    client.send_string(&chunks.len().to_string()).unwrap();
    for chunk in chunks {
        client.send(chunk).unwrap();
    }

    let answer = client.receive_string().unwrap();
    if answer == "failed" {
        return None;
    }
    let count: usize = answer.parse().unwrap();
    let mut artifact = Vec::new();
    for _ in 0..count {
        artifact.extend(client.receive().unwrap());
    }
    Some(artifact)
}

fn source_of(len: usize, tag: u8) -> Vec<u8> {
    (0..len).map(|i| b'a' + ((i as u8).wrapping_add(tag) % 26)).collect()
}

#[test]
fn test_compile_round_trip_and_failure() {
    let server = ServerProcess::start();
    let mut client = server.connect();

    let source = source_of(3 * CHUNK_SIZE + 17, 0);
    assert_eq!(compile(&mut client, &source).unwrap(), source);

    let broken = format!("int main() {{ {SYNTAX_ERROR} }}");
    assert!(compile(&mut client, broken.as_bytes()).is_none());

    client.send_string("exit").unwrap();
    drop(client);

    // nothing left over from either upload
    assert_eq!(fs::read_dir(server.work_dir()).unwrap().count(), 0);
    assert!(server.close().success());
}

#[test]
fn test_concurrent_compiles_each_get_their_own_artifact() {
    let server = ServerProcess::start();

    let clients: Vec<_> = (0..4u8)
        .map(|tag| {
            let mut client = server.connect();
            thread::spawn(move || {
                let source = source_of(2 * CHUNK_SIZE + tag as usize, tag);
                let artifact = compile(&mut client, &source).unwrap();
                client.send_string("exit").unwrap();
                artifact == source
            })
        })
        .collect();
    for client in clients {
        assert!(client.join().unwrap());
    }

    assert!(server.close().success());
}

#[test]
fn test_play_a_full_game() {
    let server = ServerProcess::start();
    let mut client = server.connect();

    client.send_string("hello").unwrap(); // ignored
    client.send_string("play").unwrap();
    assert_eq!(client.receive_string().unwrap(), "ready");

    let mut remaining = 21;
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds <= 21);
        let take = remaining.min(3);
        client.send_string(&take.to_string()).unwrap();
        let reply = client.receive_string().unwrap();
        if reply == "0|0" {
            assert_eq!(remaining, take);
            break;
        }
        let (taken, left) = reply.split_once('|').unwrap();
        let taken: u32 = taken.parse().unwrap();
        let left: u32 = left.parse().unwrap();
        assert!((1..=3).contains(&taken));
        assert_eq!(left, remaining - take - taken);
        if left == 0 {
            break;
        }
        remaining = left;
    }

    // the connection is still usable for another game
    client.send_string("play").unwrap();
    assert_eq!(client.receive_string().unwrap(), "ready");
    client.send_string("exit").unwrap();
    drop(client);

    assert!(server.close().success());
}

#[test]
fn test_close_removes_ipc_resources() {
    let server = ServerProcess::start_with(&["--claim-mode", "atomic", "--drain-timeout", "1s"]);
    let ipc_dir = server.ipc_dir();
    assert!(!key_files(&ipc_dir).is_empty());

    // an idle client does not hold the shutdown up past the drain timeout
    let idle = server.connect();
    let status = server.close();
    assert!(status.success());
    assert!(key_files(&ipc_dir).is_empty());
    drop(idle);
}
