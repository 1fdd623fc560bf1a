//! TCP accept loop and worker thread pool.
//!
//! Grounded on the persistent-slot-thread shape used elsewhere in this
//! crate for pooled workers: rather than spawning a thread per connection,
//! a fixed pool of named worker threads is started once at startup, each
//! blocking on a shared channel of accepted [`TcpStream`]s. A connection
//! is handled start-to-finish by whichever worker dequeues it, so I/O on
//! a worker's current connection is cooperative and sequential with
//! everything else that worker does, simplified to one in-flight
//! connection per worker rather than a multiplexed set (the config's
//! `worker_threads` knob is this pool's size).

use std::io::{Read, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;

use kvcached::command::CommandProcessor;
use kvcached::config::ServerConfig;
use kvcached::error::KvError;
use kvcached::protocol::{Parser, ParserEvent};
use kvcached::table::Table;
use kvcached::writer::Writer;

/// Accepts connections on `config.port` and dispatches each to a pool of
/// `config.worker_threads` persistent worker threads. Blocks forever
/// (the accept loop never returns except on a fatal bind/accept error).
pub fn run(config: ServerConfig, table: Arc<Table>) -> Result<(), KvError> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .map_err(|source| KvError::Bind { port: config.port, source })?;
    log::info!("kvcached listening on port {} with {} worker threads", config.port, config.worker_threads);

    let (tx, rx) = sync_channel::<TcpStream>(config.worker_threads * 4);
    let rx = Arc::new(std::sync::Mutex::new(rx));

    for worker_id in 0..config.worker_threads {
        spawn_worker(worker_id, Arc::clone(&rx), Arc::clone(&table));
    }

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                if tx.send(stream).is_err() {
                    log::error!("all worker threads have exited; dropping new connection");
                }
            }
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn spawn_worker(worker_id: usize, rx: Arc<std::sync::Mutex<Receiver<TcpStream>>>, table: Arc<Table>) {
    std::thread::Builder::new()
        .name(format!("kvcached-worker-{worker_id}"))
        .spawn(move || {
            let processor = CommandProcessor::new(table);
            loop {
                let stream = {
                    let queue = rx.lock().expect("worker queue poisoned");
                    match queue.recv() {
                        Ok(s) => s,
                        Err(_) => break, // accept loop (sender) is gone.
                    }
                };
                if let Err(e) = handle_connection(stream, &processor) {
                    log::debug!("connection on worker {worker_id} ended: {e}");
                }
            }
        })
        .expect("failed to spawn worker thread");
}

/// Services one connection to completion: read, parse, dispatch, respond,
/// repeat until the client disconnects, a fatal I/O error occurs, or the
/// command processor signals the connection should close (e.g. `quit`).
fn handle_connection(mut stream: TcpStream, processor: &CommandProcessor) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    let mut parser = Parser::new();
    let mut writer = Writer::default();
    let mut read_buf = vec![0u8; 64 * 1024];
    let mut events = Vec::new();

    loop {
        let n = stream.read(&mut read_buf)?;
        if n == 0 {
            return Ok(());
        }

        events.clear();
        parser.feed(&read_buf[..n], &mut events);

        let mut close = false;
        for event in events.drain(..) {
            match event {
                ParserEvent::Command(cmd) => {
                    if processor.dispatch(cmd, &mut writer) {
                        close = true;
                    }
                }
                ParserEvent::RawError(msg) => {
                    writer.reserve_and_append(&msg);
                }
                ParserEvent::MultiGetEnd => {
                    processor.multi_get_end(&mut writer);
                }
            }
        }

        writer.flush(&mut stream)?;
        if close {
            return Ok(());
        }
    }
}
