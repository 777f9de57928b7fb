//! Single-threaded, readiness-based event loop the fake upstream runs on.
//!
//! A [`Dispatcher`] owns listeners and [`Connection`]s. Anything outside the
//! loop thread talks to them by posting closures through a
//! [`DispatcherHandle`] or a [`ConnectionHandle`].

mod connection;
mod dispatcher;
mod listener;
mod transport;

pub use connection::*;
pub use dispatcher::*;
pub use listener::*;
pub use transport::{ReadOutcome, Socket, Transport};

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::{IpVersion, ListenEndpoint};

    struct Echo;

    impl ReadFilter for Echo {
        fn on_data(&mut self, connection: &mut Connection, data: &mut Vec<u8>) -> FilterStatus {
            let bytes: Vec<u8> = data.drain(..).collect();
            connection.write(&bytes);
            FilterStatus::StopIteration
        }
    }

    struct InstallEcho;

    impl FilterChainFactory for InstallEcho {
        fn create_filter_chain(&mut self, connection: &mut Connection) -> bool {
            connection.add_read_filter(Box::new(Echo));
            true
        }
    }

    struct Reject;

    impl FilterChainFactory for Reject {
        fn create_filter_chain(&mut self, _connection: &mut Connection) -> bool {
            false
        }
    }

    struct Recorder(Arc<Mutex<Vec<ConnectionEvent>>>);

    impl ConnectionCallbacks for Recorder {
        fn on_event(&mut self, event: ConnectionEvent) {
            self.0.lock().expect("lock").push(event);
        }
    }

    fn spin(dispatcher: &mut Dispatcher, mut done: impl FnMut(&mut Dispatcher) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(dispatcher) {
            assert!(Instant::now() < deadline, "dispatcher did not settle");
            dispatcher.run(RunType::NonBlock).expect("should turn");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn bound(dispatcher: &mut Dispatcher, factory: Box<dyn FilterChainFactory>) -> ListenEndpoint {
        let listener =
            Listener::bind(&ListenEndpoint::loopback(0, IpVersion::V4)).expect("should bind");
        let endpoint = listener.local_endpoint().clone();
        dispatcher
            .add_listener(listener, factory)
            .expect("should register");
        endpoint
    }

    #[test]
    fn echoes_bytes_on_accepted_connection() {
        let mut dispatcher = Dispatcher::new().expect("should create");
        let endpoint = bound(&mut dispatcher, Box::new(InstallEcho));

        let mut client =
            TcpStream::connect(endpoint.ip().expect("tcp")).expect("should connect");
        client.write_all(b"ping").expect("should write");
        client
            .set_nonblocking(true)
            .expect("should be nonblocking");

        let mut echoed = Vec::new();
        spin(&mut dispatcher, |_| {
            let mut chunk = [0_u8; 16];
            if let Ok(read) = client.read(&mut chunk) {
                echoed.extend_from_slice(&chunk[..read]);
            }
            echoed.len() >= 4
        });

        assert_eq!(echoed, b"ping");
    }

    #[test]
    fn rejected_connections_are_closed() {
        let mut dispatcher = Dispatcher::new().expect("should create");
        let endpoint = bound(&mut dispatcher, Box::new(Reject));

        let mut client =
            TcpStream::connect(endpoint.ip().expect("tcp")).expect("should connect");
        client
            .set_read_timeout(Some(Duration::from_millis(5)))
            .expect("should set timeout");

        spin(&mut dispatcher, |_| {
            let mut chunk = [0_u8; 1];
            matches!(client.read(&mut chunk), Ok(0))
        });
    }

    #[test]
    fn posted_tasks_run_in_order() {
        let mut dispatcher = Dispatcher::new().expect("should create");
        let handle = dispatcher.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for item in 0..5 {
            let seen = Arc::clone(&seen);
            handle.post(move |_| seen.lock().expect("lock").push(item));
        }
        handle.exit();

        dispatcher.run(RunType::Block).expect("should run");
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn client_connection_raises_connected_then_remote_close() {
        let mut server = Dispatcher::new().expect("should create");
        let endpoint = bound(&mut server, Box::new(Reject));

        let mut client = Dispatcher::new().expect("should create");
        let handle = client.connect(&endpoint).expect("should connect");
        let events = Arc::new(Mutex::new(Vec::new()));
        client
            .connection_mut(handle.id())
            .expect("connection exists")
            .add_connection_callbacks(Box::new(Recorder(Arc::clone(&events))));

        let deadline = Instant::now() + Duration::from_secs(5);
        while events.lock().expect("lock").len() < 2 {
            assert!(Instant::now() < deadline, "events never arrived");
            server.run(RunType::NonBlock).expect("server turn");
            client.run(RunType::NonBlock).expect("client turn");
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(
            *events.lock().expect("lock"),
            vec![ConnectionEvent::Connected, ConnectionEvent::RemoteClose]
        );
    }

    #[test]
    fn callbacks_added_after_close_see_the_close() {
        let mut server = Dispatcher::new().expect("should create");
        let endpoint = bound(&mut server, Box::new(Reject));
        let mut client = Dispatcher::new().expect("should create");
        let handle = client.connect(&endpoint).expect("should connect");

        handle.close(CloseType::NoFlush);
        spin(&mut client, |dispatcher| {
            dispatcher
                .connection_mut(handle.id())
                .is_some_and(|connection| !connection.is_open())
        });

        let events = Arc::new(Mutex::new(Vec::new()));
        client
            .connection_mut(handle.id())
            .expect("tombstone stays")
            .add_connection_callbacks(Box::new(Recorder(Arc::clone(&events))));

        assert_eq!(*events.lock().expect("lock"), vec![ConnectionEvent::LocalClose]);
    }

    #[test]
    fn read_disable_holds_bytes_until_enabled() {
        struct Collect(Arc<Mutex<Vec<u8>>>);

        impl ReadFilter for Collect {
            fn on_data(&mut self, _: &mut Connection, data: &mut Vec<u8>) -> FilterStatus {
                self.0.lock().expect("lock").extend(data.drain(..));
                FilterStatus::Continue
            }
        }

        struct DisabledCollector(Arc<Mutex<Vec<u8>>>, Arc<Mutex<Option<ConnectionHandle>>>);

        impl FilterChainFactory for DisabledCollector {
            fn create_filter_chain(&mut self, connection: &mut Connection) -> bool {
                connection.read_disable(true);
                connection.add_read_filter(Box::new(Collect(Arc::clone(&self.0))));
                *self.1.lock().expect("lock") = Some(connection.handle());
                true
            }
        }

        let collected = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(Mutex::new(None));
        let mut dispatcher = Dispatcher::new().expect("should create");
        let endpoint = bound(
            &mut dispatcher,
            Box::new(DisabledCollector(
                Arc::clone(&collected),
                Arc::clone(&accepted),
            )),
        );

        let mut client =
            TcpStream::connect(endpoint.ip().expect("tcp")).expect("should connect");
        client.write_all(b"held").expect("should write");

        spin(&mut dispatcher, |_| accepted.lock().expect("lock").is_some());
        for _ in 0..20 {
            dispatcher.run(RunType::NonBlock).expect("should turn");
        }
        assert!(collected.lock().expect("lock").is_empty());

        let handle = accepted.lock().expect("lock").clone().expect("accepted");
        handle.read_disable(false);
        spin(&mut dispatcher, |_| collected.lock().expect("lock").len() == 4);

        assert_eq!(*collected.lock().expect("lock"), b"held");
    }
}
