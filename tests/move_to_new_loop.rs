//! End-to-end coverage for the move-to-new-loop protocol (SPEC_FULL.md §8,
//! scenario 2): a connection accepted and dispatched onto a worker loop
//! migrates back to the listen loop on its first message, with no bytes
//! lost and exactly one success notification.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netreactor::acceptor::Acceptor;
use netreactor::connection::Connection;
use netreactor::event_loop::{EventLoop, EventLoopHandle};
use netreactor::loop_thread::EventLoopThreadPool;

fn spawn_loop(name: &str) -> (EventLoopHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let name = name.to_string();
    let join = std::thread::spawn(move || {
        let mut ev = EventLoop::new(&name).unwrap();
        let handle = ev.handle();
        tx.send(handle).unwrap();
        ev.run();
    });
    let handle = rx.recv().unwrap();
    (handle, join)
}

#[test]
fn connection_migrates_back_to_listen_loop_on_first_message() {
    let (listen_handle, listen_join) = spawn_loop("it-listen");
    let pool = Arc::new(EventLoopThreadPool::start(2, "it-workers").unwrap());

    let acceptor = Acceptor::listen(listen_handle.clone(), "tcp://127.0.0.1:0").unwrap();
    let local_addr = acceptor.local_addr();

    let moved_back = Arc::new(AtomicBool::new(false));
    let success_calls = Arc::new(AtomicUsize::new(0));
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let slot: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));

    let listen_handle_for_cb = listen_handle.clone();
    let moved_back2 = moved_back.clone();
    let success_calls2 = success_calls.clone();
    let received2 = received.clone();
    let pool_for_cb = pool.clone();
    let slot_for_cb = slot.clone();

    acceptor.set_new_connection_callback(Box::new(move |fd, local, remote, _is_tls| {
        let conn = Connection::new(fd, local, remote);
        *slot_for_cb.lock().unwrap() = Some(conn.clone());
        let listen_handle_inner = listen_handle_for_cb.clone();
        let moved_back3 = moved_back2.clone();
        let success_calls3 = success_calls2.clone();
        let received3 = received2.clone();
        let first_message = Arc::new(AtomicBool::new(true));

        conn.set_message_callback(Box::new(move |c, buf| {
            received3.lock().unwrap().extend_from_slice(buf.as_slice());
            let len = buf.as_slice().len();
            buf.skip(len);

            if first_message.swap(false, Ordering::SeqCst) {
                let moved_back4 = moved_back3.clone();
                let success_calls4 = success_calls3.clone();
                c.move_to_new_loop(
                    listen_handle_inner.clone(),
                    move |_c| {
                        success_calls4.fetch_add(1, Ordering::SeqCst);
                        moved_back4.store(true, Ordering::SeqCst);
                    },
                    |_c| {
                        panic!("move_to_new_loop unexpectedly failed");
                    },
                );
            }
        }));

        let conn_for_dispatch = conn.clone();
        pool_for_cb.run_in_next_loop(move |ev| {
            conn_for_dispatch.attached_to_loop(ev.handle());
        });
    }));

    listen_handle.run_in_loop({
        let acceptor = acceptor.clone();
        move |_ev| {
            acceptor.start_accept().unwrap();
        }
    });

    let mut stream = TcpStream::connect(local_addr).unwrap();
    stream.write_all(b"hello").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !moved_back.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(moved_back.load(Ordering::SeqCst), "connection never migrated back to the listen loop");
    assert_eq!(success_calls.load(Ordering::SeqCst), 1, "success callback must fire exactly once");
    assert_eq!(&received.lock().unwrap()[..], b"hello", "no bytes lost across the migration");

    let migrated_loop = slot.lock().unwrap().as_ref().unwrap().loop_handle();
    assert!(
        migrated_loop.as_ref() == Some(&listen_handle),
        "connection's loop reference must equal the listen loop"
    );

    acceptor.stop();
    pool.stop();
    EventLoop::stop(&listen_handle);
    let _ = listen_join.join();
}
