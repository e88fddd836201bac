use bytes::{Buf, BufMut, BytesMut};
use clap::Parser;
use clap_derive::Parser;
use rudp::config::RudpConfig;
use rudp::connection::{ConnectionState, MessageConnection};
use rudp::logging::{LogChannels, LogConfig};
use rudp::message::{ContentId, MessageFlags, MessageId, NO_CONTENT_ID};
use rudp::message_handler::MessageHandler;
use rudp::network::Network;
use rudp::packet_id::PacketId;
use rudp::ref_counted::Handle;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::info;

const MSG_POSITION: MessageId = 1;
const MSG_CHAT: MessageId = 2;

#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 8)]
    entities: u32,

    #[clap(long, default_value_t = 100)]
    ticks: u32,

    #[clap(long, default_value_t = 5)]
    tick_millis: u64,

    /// log channels, e.g. "ERROR | INFO | DATA"
    #[clap(long, default_value = "ERROR | INFO")]
    log: String,

    #[clap(long)]
    log_file: Option<PathBuf>,
}

/// Position update: entity id (u32), x (f32), y (f32). The entity id doubles as the content id,
///  so an update that is superseded before it is acknowledged is not retransmitted.
struct PositionHandler {
    positions: Mutex<Vec<Option<(f32, f32)>>>,
    num_received: AtomicUsize,
}

impl MessageHandler for PositionHandler {
    fn handle_message(&self, source: &Handle<MessageConnection>, packet_id: PacketId, message_id: MessageId, mut data: &[u8]) {
        match message_id {
            MSG_POSITION => {
                if data.len() != 12 {
                    info!("malformed position update from {:?}", source.peer_addr());
                    return;
                }
                let entity = data.get_u32() as usize;
                let pos = (data.get_f32(), data.get_f32());
                self.num_received.fetch_add(1, Ordering::Relaxed);

                let mut positions = self.positions.lock().unwrap();
                if entity >= positions.len() {
                    positions.resize(entity + 1, None);
                }
                positions[entity] = Some(pos);
            }
            MSG_CHAT => {
                info!("chat from {:?} in packet {}: {}", source.peer_addr(), packet_id, String::from_utf8_lossy(data));
            }
            _ => {
                info!("unknown message id {} from {:?}", message_id, source.peer_addr());
            }
        }
    }

    fn compute_content_id(&self, message_id: MessageId, mut data: &[u8]) -> ContentId {
        match message_id {
            // content id 0 means 'no content id', so shift entity ids by one
            MSG_POSITION if data.len() >= 4 => data.get_u32().wrapping_add(1),
            _ => NO_CONTENT_ID,
        }
    }

    fn on_connection_state_changed(&self, source: &Handle<MessageConnection>, state: ConnectionState) {
        info!("connection to {:?} is now {:?}", source.peer_addr(), state);
    }
}

impl PositionHandler {
    fn new() -> PositionHandler {
        PositionHandler {
            positions: Default::default(),
            num_received: AtomicUsize::new(0),
        }
    }
}

fn position_update(entity: u32, tick: u32) -> BytesMut {
    let angle = (entity as f32) + (tick as f32) * 0.05;
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u32(entity);
    buf.put_f32(10.0 * angle.cos());
    buf.put_f32(10.0 * angle.sin());
    buf
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    LogConfig {
        channels: LogChannels::parse(&args.log)?,
        log_file: args.log_file,
    }.init()?;

    let mut config = RudpConfig::default_ipv4();
    config.self_addr = "127.0.0.1:0".parse()?;

    let client_handler = Arc::new(PositionHandler::new());
    let server_handler = Arc::new(PositionHandler::new());
    let client = Network::bind(config.clone(), client_handler)?;
    let server = Network::bind(config, server_handler.clone())?;
    client.start()?;
    server.start()?;

    let conn = client.connect(server.local_addr())?;
    conn.send(MSG_CHAT, b"hello", MessageFlags::RELIABLE | MessageFlags::IN_ORDER)?;

    let mut num_sent = 0;
    for tick in 0..args.ticks {
        for entity in 0..args.entities {
            conn.send(MSG_POSITION, &position_update(entity, tick), MessageFlags::RELIABLE)?;
            num_sent += 1;
        }
        thread::sleep(Duration::from_millis(args.tick_millis));
    }
    conn.send(MSG_CHAT, b"bye", MessageFlags::RELIABLE | MessageFlags::IN_ORDER)?;
    thread::sleep(Duration::from_millis(200));

    let stats = conn.stats();
    info!("sent {} position updates, {} were delivered, the rest was superseded", num_sent, server_handler.num_received.load(Ordering::Relaxed));
    info!("client stats: {:?}, round trip time {:?}", stats, conn.round_trip_time());
    for (entity, pos) in server_handler.positions.lock().unwrap().iter().enumerate() {
        info!("entity {}: {:?}", entity, pos);
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}
