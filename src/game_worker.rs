//! The game worker loop: one request in, its replies out, strictly in
//! arrival order across all sessions.

use {
    crate::{
        error::IpcError,
        game::{GameSessions, Reply, Request},
        session_queue::{SessionKey, SessionQueues},
        shutdown::Shutdown,
    },
    log::{debug, info, warn},
    rand::Rng,
};

pub struct GameWorker<R> {
    queues: SessionQueues,
    sessions: GameSessions,
    rng: R,
}

impl<R: Rng> GameWorker<R> {
    pub fn new(queues: SessionQueues, rng: R) -> Self {
        Self {
            queues,
            sessions: GameSessions::new(),
            rng,
        }
    }

    /// Serve until the token fires or the queues are removed.
    pub fn run(&mut self, token: &Shutdown) -> Result<(), IpcError> {
        info!("game worker serving");
        loop {
            match self.serve_one(token) {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => {
                    info!("game worker stopping: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn serve_one(&mut self, token: &Shutdown) -> Result<(), IpcError> {
        let (key, text) = self.queues.receive_request(token)?;
        debug!("session {key}: request {text:?}");

        let replies = match Request::parse(&text) {
            Ok(request) => self.sessions.handle(key, &request, &mut self.rng),
            Err(e) => {
                warn!("session {key}: {e}, dropping session");
                vec![self.sessions.reject(key)]
            }
        };
        for reply in replies {
            log_reply(key, &reply);
            self.queues.send_reply(key, &reply.encode(), token)?;
        }
        Ok(())
    }
}

fn log_reply(key: SessionKey, reply: &Reply) {
    match reply {
        Reply::Ready => info!("client {key} started a game"),
        Reply::ClientWon => info!("client {key} won the game"),
        Reply::ClientLost { taken } => info!("client {key} lost the game, worker took {taken}"),
        Reply::WorkerTook { taken, remaining } => {
            debug!("client {key}: worker took {taken}, {remaining} left")
        }
        Reply::Pending { remaining } => debug!("client {key}: {remaining} left"),
        Reply::Abandoned => info!("client {key} abandoned the game"),
        Reply::Rejected(reason) => warn!("client {key}: rejected ({reason:?})"),
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::game::{RejectReason, INITIAL_REMAINING},
        rand::{rngs::StdRng, SeedableRng},
        std::thread,
    };

    #[test]
    fn test_worker_over_real_queues() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = SessionQueues::create(dir.path(), 1, 2).unwrap();
        let worker_queues = SessionQueues::open(dir.path(), 1, 2).unwrap();
        let token = Shutdown::new();

        let worker = thread::spawn(move || {
            let mut worker = GameWorker::new(worker_queues, StdRng::seed_from_u64(5));
            worker.run(&Shutdown::new())
        });

        let key = SessionKey::new(42).unwrap();
        client.send_request(key, &Request::Start.encode(), &token).unwrap();
        assert_eq!(client.receive_reply(key, &token).unwrap(), "ready");

        client.send_request(key, &Request::Take(3).encode(), &token).unwrap();
        assert_eq!(
            Reply::parse(&client.receive_reply(key, &token).unwrap()).unwrap(),
            Reply::Pending { remaining: INITIAL_REMAINING - 3 }
        );
        match Reply::parse(&client.receive_reply(key, &token).unwrap()).unwrap() {
            Reply::WorkerTook { taken, remaining } => assert_eq!(remaining, 18 - taken),
            other => panic!("unexpected reply {other:?}"),
        }

        client.send_request(key, "jump", &token).unwrap();
        assert_eq!(
            Reply::parse(&client.receive_reply(key, &token).unwrap()).unwrap(),
            Reply::Rejected(RejectReason::BadRequest)
        );
        // the violation ended the session
        client.send_request(key, &Request::Take(1).encode(), &token).unwrap();
        assert_eq!(
            Reply::parse(&client.receive_reply(key, &token).unwrap()).unwrap(),
            Reply::Rejected(RejectReason::NoSession)
        );

        client.remove().unwrap();
        worker.join().unwrap().unwrap();
    }
}
