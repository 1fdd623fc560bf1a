mod server;

use std::sync::Arc;

use clap::Parser;
use kvcached::config::ServerConfig;
use kvcached::swiper::Swiper;
use kvcached::table::Table;

/// Run a memcached wire-protocol compatible in-memory cache server.
#[derive(Parser, Debug)]
#[command(name = "kvcached", about = "Memcached-compatible in-memory cache server")]
struct Args {
    /// TCP port to listen on.
    #[arg(short = 'p', long, default_value_t = 7500)]
    port: u16,

    /// Number of worker threads servicing connections.
    #[arg(short = 't', long, default_value_t = 1)]
    threads: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = ServerConfig::new(args.port, args.threads);

    let table = Arc::new(Table::new(config.num_objects, config.inline_keylen, config.inline_vallen));
    let mut swiper = Swiper::spawn(Arc::clone(&table), config.swiper_interval, config.pqueue_size);

    if let Err(e) = server::run(config, table) {
        log::error!("fatal server error: {e}");
        swiper.stop();
        std::process::exit(1);
    }
}
