//! Operation registry.
//!
//! Operations are keyed by the 32-bit FNV-1a hash of their name. Both peers compute the hash
//! independently, so the hash function is part of the wire contract.
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;

use ferry_util::Mutex;

use crate::handle::RpcHandle;
use crate::proc::{Decoder, Encoder, Proc};
use crate::{Error, Result};

/// Name under which the finalize control operation is registered.
pub const FINALIZE_NAME: &str = "finalize";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId(pub u32);

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// 32-bit FNV-1a over the UTF-8 bytes of `name`.
pub fn rpc_id(name: &str) -> RpcId {
    let hash = name.as_bytes().iter().fold(FNV_OFFSET_BASIS, |h, &b| {
        (h ^ b as u32).wrapping_mul(FNV_PRIME)
    });
    RpcId(hash)
}

/// A decoded input, type-erased.
pub type Input = Box<dyn Any + Send>;

pub type DecodeFn = Arc<dyn Fn(&mut Decoder<'_>) -> Result<Input> + Send + Sync>;
pub type EncodeFn = Arc<dyn Fn(&dyn Any, &mut Encoder) -> Result<()> + Send + Sync>;
pub type DispatchFn = Arc<dyn Fn(&RpcHandle) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Entry {
    pub name: Arc<str>,
    pub id: RpcId,
    pub(crate) decoder: DecodeFn,
    pub(crate) encoder: EncodeFn,
    pub(crate) dispatcher: DispatchFn,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

pub(crate) fn decoder_for<I: Proc + Send + 'static>() -> DecodeFn {
    Arc::new(|dec: &mut Decoder<'_>| Ok(Box::new(I::decode(dec)?) as Input))
}

pub(crate) fn encoder_for<O: Proc + 'static>() -> EncodeFn {
    Arc::new(|out: &dyn Any, enc: &mut Encoder| {
        out.downcast_ref::<O>()
            .ok_or_else(|| {
                Error::EncodeFailed(format!(
                    "output is not a {}",
                    std::any::type_name::<O>()
                ))
            })?
            .encode(enc)
    })
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<FnvHashMap<RpcId, Entry>>,
    // Set once progress starts; registration is closed from then on.
    sealed: AtomicBool,
}

impl Registry {
    pub(crate) fn register(
        &self,
        name: &str,
        decoder: DecodeFn,
        encoder: EncodeFn,
        dispatcher: DispatchFn,
    ) -> Result<RpcId> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument(format!(
                "cannot register {:?} after progress has started",
                name
            )));
        }
        let id = rpc_id(name);
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id) {
            let reason = if &*existing.name == name {
                format!("{:?} is already registered", name)
            } else {
                format!("{:?} collides with {:?} on id {}", name, existing.name, id)
            };
            return Err(Error::InvalidArgument(reason));
        }
        entries.insert(
            id,
            Entry {
                name: Arc::from(name),
                id,
                decoder,
                encoder,
                dispatcher,
            },
        );
        tracing::debug!("registered {} as {}", name, id);
        Ok(id)
    }

    pub(crate) fn lookup(&self, id: RpcId) -> Result<Entry> {
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownOp(id.0))
    }

    #[inline]
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> DispatchFn {
        Arc::new(|_: &RpcHandle| Ok(()))
    }

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(rpc_id(""), RpcId(0x811c9dc5));
        assert_eq!(rpc_id("a"), RpcId(0xe40c292c));
        assert_eq!(rpc_id("foobar"), RpcId(0xbf9cf968));
    }

    #[test]
    fn lookup_by_hash_of_name() {
        let reg = Registry::default();
        for name in ["open", "read", "write", "close"] {
            reg.register(name, decoder_for::<u32>(), encoder_for::<u32>(), noop())
                .unwrap();
        }
        for name in ["open", "read", "write", "close"] {
            assert_eq!(&*reg.lookup(rpc_id(name)).unwrap().name, name);
        }
        assert!(matches!(
            reg.lookup(RpcId(0xdeadbeef)),
            Err(Error::UnknownOp(0xdeadbeef))
        ));
    }

    #[test]
    fn duplicate_name_rejected() {
        let reg = Registry::default();
        reg.register("open", decoder_for::<()>(), encoder_for::<()>(), noop())
            .unwrap();
        let err = reg
            .register("open", decoder_for::<()>(), encoder_for::<()>(), noop())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(reg.entries.lock().len(), 1);
    }

    #[test]
    fn sealed_registry_rejects() {
        let reg = Registry::default();
        reg.seal();
        assert!(reg
            .register("late", decoder_for::<()>(), encoder_for::<()>(), noop())
            .is_err());
    }

    #[test]
    fn encoder_checks_output_type() {
        let enc_fn = encoder_for::<u32>();
        let mut enc = Encoder::new();
        enc_fn(&5u32, &mut enc).unwrap();
        assert_eq!(enc.as_bytes(), &5u32.to_le_bytes());
        assert_eq!(
            enc_fn(&String::new(), &mut enc).unwrap_err().code(),
            crate::Code::EncodeFailed
        );
    }
}
