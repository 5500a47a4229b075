use std::sync::Arc;

use anyhow::ensure;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use ferry::{
    rpc_id, Address, BulkAccess, BulkDescriptor, Context, LocalSegment, MemBuffer, FINALIZE_NAME,
};
use ferry_na::loopback::Fabric;

use crate::config::Config;
use crate::proto::{self, ReadIn, TransferOut, WriteIn, BULK_READ, BULK_WRITE};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Split `total` bytes into `n` buffers; the last one takes the remainder.
fn scatter(total: u64, n: usize, fill: Option<&mut StdRng>) -> Vec<LocalSegment> {
    let base = total / n as u64;
    let mut fill = fill;
    (0..n)
        .map(|i| {
            let len = if i + 1 == n {
                total - base * (n as u64 - 1)
            } else {
                base
            };
            let mut data = vec![0u8; len as usize];
            if let Some(rng) = fill.as_deref_mut() {
                rng.fill_bytes(&mut data);
            }
            LocalSegment::whole(MemBuffer::from_vec(data))
        })
        .collect()
}

/// Upload, download, then finalize. The finalize request is sent even when a transfer failed
/// so the server's barrier still completes.
pub fn run(fabric: &Fabric, server: &Address, index: usize, config: &Config) -> anyhow::Result<ClientStats> {
    let ctx = Context::new(Arc::new(fabric.endpoint()), config.context);
    let name = format!("client-{}", index);
    let exchanged = exchange(&ctx, server, index, &name, config);
    if let Err(e) = &exchanged {
        tracing::error!("{} failed: {}", name, e);
    }
    ctx.call::<(), ()>(
        server,
        rpc_id(FINALIZE_NAME),
        &(),
        config.server.rpc_timeout_ms,
    )?;
    exchanged
}

fn exchange(
    ctx: &Context,
    server: &Address,
    index: usize,
    name: &str,
    config: &Config,
) -> anyhow::Result<ClientStats> {
    let cfg = &config.server;
    let mut rng = StdRng::seed_from_u64(index as u64);

    let source = BulkDescriptor::create_segments(
        ctx,
        scatter(cfg.transfer_size, cfg.segments, Some(&mut rng)),
        BulkAccess::ReadOnly,
    )?;
    let expected = proto::checksum(&source.read_to_vec()?);
    let up: TransferOut = ctx.call(
        server,
        rpc_id(BULK_WRITE),
        &WriteIn {
            client: name.to_owned(),
            data: source.clone(),
        },
        cfg.rpc_timeout_ms,
    )?;
    source.free()?;
    ensure!(up.len == cfg.transfer_size, "server pulled {} bytes", up.len);
    ensure!(up.checksum == expected, "upload checksum mismatch");

    let seed = index as u32;
    let sink = BulkDescriptor::create_segments(
        ctx,
        scatter(cfg.transfer_size, cfg.segments, None),
        BulkAccess::WriteOnly,
    )?;
    let down: TransferOut = ctx.call(
        server,
        rpc_id(BULK_READ),
        &ReadIn {
            seed,
            data: sink.clone(),
        },
        cfg.rpc_timeout_ms,
    )?;
    let received = sink.read_to_vec()?;
    sink.free()?;
    ensure!(
        received == proto::pattern(seed, received.len()),
        "download content mismatch"
    );
    ensure!(down.checksum == proto::checksum(&received), "download checksum mismatch");

    tracing::info!(
        "{} moved {} bytes each way over {} segments",
        name,
        cfg.transfer_size,
        cfg.segments
    );
    Ok(ClientStats {
        uploaded: up.len,
        downloaded: down.len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_covers_total() {
        let parts = scatter(1000, 3, None);
        let lens: Vec<u64> = parts.iter().map(|p| p.len).collect();
        assert_eq!(lens, vec![333, 333, 334]);
    }
}
