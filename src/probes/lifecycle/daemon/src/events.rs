//! Event processing from eBPF perf buffers
//!
//! One reader task per online CPU per address family. Decoded events fan
//! in over an mpsc channel to whoever consumes them; decoding problems
//! cost a single sample, never the stream.

use anyhow::Result;
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::MapData;
use aya::util::online_cpus;
use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::types::{decode_v4, decode_v6, EventError, TcpEvent};

/// Per-CPU buffers handed to each perf read.
const READ_BUFFERS: usize = 16;

/// Spawn reader tasks for both event arrays. Readers run until the
/// receiving side of `tx` is dropped.
pub fn spawn_readers(
    v4: AsyncPerfEventArray<MapData>,
    v6: AsyncPerfEventArray<MapData>,
    tx: mpsc::UnboundedSender<TcpEvent>,
) -> Result<()> {
    spawn_family_readers(v4, tx.clone(), decode_v4, "ipv4")?;
    spawn_family_readers(v6, tx, decode_v6, "ipv6")?;
    Ok(())
}

fn spawn_family_readers(
    mut array: AsyncPerfEventArray<MapData>,
    tx: mpsc::UnboundedSender<TcpEvent>,
    decode: fn(&[u8]) -> Result<TcpEvent, EventError>,
    family: &'static str,
) -> Result<()> {
    let cpus = online_cpus().map_err(|(_, e)| e)?;
    debug!("spawning {family} event readers for {} cpus", cpus.len());

    for cpu_id in cpus {
        let mut buf = array.open(cpu_id, None)?;
        let tx = tx.clone();

        tokio::spawn(async move {
            let mut buffers = (0..READ_BUFFERS)
                .map(|_| BytesMut::with_capacity(1024))
                .collect::<Vec<_>>();

            loop {
                let events = match buf.read_events(&mut buffers).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("error reading {family} events on cpu {cpu_id}: {e}");
                        continue;
                    }
                };

                if events.lost > 0 {
                    warn!("lost {} {family} events on cpu {cpu_id}", events.lost);
                }

                for sample in buffers.iter_mut().take(events.read) {
                    match decode(&sample[..]) {
                        Ok(event) => {
                            // Receiver gone means we are shutting down.
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("skipping undecodable {family} sample: {e}"),
                    }
                }
            }
        });
    }

    Ok(())
}
