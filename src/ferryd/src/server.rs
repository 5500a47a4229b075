use std::sync::Arc;

use anyhow::bail;

use ferry::{
    Address, BulkAccess, BulkDescriptor, BulkRequest, Context, ContextConfig, NetworkLayer,
    RpcHandle,
};
use ferry_util::Time;

use crate::proto::{self, ReadIn, TransferOut, WriteIn, BULK_READ, BULK_WRITE};

const TRANSFER_TIMEOUT_MS: u64 = 10_000;

pub struct Server {
    ctx: Context,
}

impl Server {
    pub fn new(na: Arc<dyn NetworkLayer>, config: ContextConfig) -> anyhow::Result<Self> {
        let ctx = Context::new(na, config);
        ctx.register::<WriteIn, TransferOut, _>(BULK_WRITE, bulk_write)?;
        ctx.register::<ReadIn, TransferOut, _>(BULK_READ, bulk_read)?;
        ctx.register_finalize(|h| {
            tracing::info!("client {} finished", h.peer());
            Ok(())
        })?;
        Ok(Server { ctx })
    }

    #[inline]
    pub fn addr(&self) -> Address {
        self.ctx.addr_self()
    }

    /// Drive progress until `clients` finalize requests arrived, then shut the context down.
    ///
    /// Gives up once nothing happened for `idle_timeout_ms`.
    pub fn serve(&self, clients: usize, poll_ms: u64, idle_timeout_ms: u64) -> anyhow::Result<()> {
        let idle_limit = Time::from_millis(idle_timeout_ms);
        let mut last_activity = Time::now();
        while self.ctx.finalize_count() < clients {
            match self.ctx.process(poll_ms) {
                Ok(()) => last_activity = Time::now(),
                Err(e) if e.is_timeout() => {
                    if !(Time::now() - last_activity).less(&idle_limit) {
                        bail!(
                            "idle for {} with {} of {} clients finalized",
                            idle_limit,
                            self.ctx.finalize_count(),
                            clients
                        );
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.ctx.finalize()?;
        tracing::info!(
            "server on {} drained, {} live handles",
            self.addr(),
            self.ctx.live_handles()
        );
        Ok(())
    }
}

fn finish(ctx: &Context, reqs: &[BulkRequest]) -> ferry::Result<()> {
    let mut result = Ok(());
    for req in reqs {
        if result.is_ok() {
            result = ctx.bulk_wait(req, TRANSFER_TIMEOUT_MS);
        }
    }
    for req in reqs {
        ctx.bulk_free_request(req)?;
    }
    result
}

/// Pull the caller's region in two halves.
fn bulk_write(h: &RpcHandle) -> ferry::Result<()> {
    let ctx = h.context();
    let input: WriteIn = h.get_input()?;
    let size = input.data.size();
    let local = BulkDescriptor::alloc(ctx, size, BulkAccess::ReadWrite)?;

    let half = size / 2;
    let first = ctx.bulk_pull(&input.data, 0, &local, 0, half)?;
    let second = ctx.bulk_pull(&input.data, half, &local, half, size - half)?;
    finish(ctx, &[first, second])?;

    let checksum = proto::checksum(&local.read_to_vec()?);
    local.free()?;
    tracing::debug!(
        "{} uploaded {} bytes in {} segments",
        input.client,
        size,
        input.data.segments().len()
    );
    h.complete(&TransferOut {
        len: size,
        checksum,
    })
}

/// Push a seeded pattern into the caller's region.
fn bulk_read(h: &RpcHandle) -> ferry::Result<()> {
    let ctx = h.context();
    let input: ReadIn = h.get_input()?;
    let size = input.data.size();
    let len = usize::try_from(size)
        .map_err(|_| ferry::Error::InvalidArgument(format!("{} bytes do not fit", size)))?;
    let local = BulkDescriptor::alloc(ctx, size, BulkAccess::ReadOnly)?;
    let data = proto::pattern(input.seed, len);
    local.write_at(0, &data)?;

    let req = ctx.bulk_push(&input.data, 0, &local, 0, size)?;
    finish(ctx, &[req])?;
    local.free()?;
    h.complete(&TransferOut {
        len: size,
        checksum: proto::checksum(&data),
    })
}

#[cfg(test)]
mod tests {
    use ferry_na::loopback::Fabric;

    use super::*;
    use crate::client;
    use crate::config::Config;

    const CONFIG: &str = r#"
        log_level = "debug"

        [server]
        clients = 2
        transfer_size = 10000
        segments = 3
        progress_timeout_ms = 20
    "#;

    #[test]
    fn clients_pass_the_barrier() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let fabric = Fabric::new();
        let server = Server::new(Arc::new(fabric.endpoint()), config.context).unwrap();
        let addr = server.addr();

        crossbeam::thread::scope(|s| {
            let handles: Vec<_> = (0..config.server.clients)
                .map(|i| {
                    let (fabric, addr, config) = (&fabric, &addr, &config);
                    s.spawn(move |_| client::run(fabric, addr, i, config))
                })
                .collect();
            server
                .serve(config.server.clients, 20, config.server.rpc_timeout_ms)
                .unwrap();
            for h in handles {
                let stats = h.join().unwrap().unwrap();
                assert_eq!(stats.uploaded, 10000);
                assert_eq!(stats.downloaded, 10000);
            }
        })
        .unwrap();
    }
}
