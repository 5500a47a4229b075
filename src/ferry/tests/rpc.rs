use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::thread;
use rand::prelude::*;
use rand::rngs::StdRng;

use ferry::{
    proc_struct, rpc_id, BulkAccess, BulkDescriptor, Code, Context, ContextConfig, Error, MemBuffer,
    RpcHandle, RpcId, FINALIZE_NAME,
};
use ferry_na::loopback::Fabric;

const SEED: u64 = 1234;

proc_struct! {
    #[derive(Debug, Clone, PartialEq)]
    struct Record {
        name: String,
        values: Vec<u64>,
        note: Option<String>,
    }
}

fn context(fabric: &Fabric) -> Context {
    Context::new(Arc::new(fabric.endpoint()), ContextConfig::default())
}

/// Pull the caller's region and reply with the sum of its bytes.
fn checksum_handler(h: &RpcHandle) -> ferry::Result<()> {
    let ctx = h.context();
    let remote: BulkDescriptor = h.get_input()?;
    let local = BulkDescriptor::alloc(ctx, remote.size(), BulkAccess::ReadWrite)?;
    let req = ctx.bulk_pull_all(&remote, &local)?;
    ctx.bulk_wait(&req, 2000)?;
    ctx.bulk_free_request(&req)?;
    let sum: u64 = local.read_to_vec()?.iter().map(|&b| b as u64).sum();
    h.complete(&sum)
}

#[test]
fn unknown_op_is_answered_and_retired() {
    let fabric = Fabric::new();
    let server = context(&fabric);
    let client = context(&fabric);
    server
        .register::<(), (), _>("known", |h| h.complete_empty())
        .unwrap();

    let call = client
        .forward_raw(&server.addr_self(), RpcId(0xDEAD_BEEF), &[])
        .unwrap();
    server.process(1000).unwrap();
    let err = client.wait_reply_raw(&call, 1000).unwrap_err();
    assert_eq!(err.code(), Code::UnknownOp);

    server.finalize().unwrap();
    assert_eq!(server.live_handles(), 0);
}

#[test]
fn undecodable_input_is_reported() {
    let fabric = Fabric::new();
    let server = context(&fabric);
    let client = context(&fabric);
    let id = server
        .register::<u64, u64, _>("wide", |h| h.complete(&h.get_input::<u64>()?))
        .unwrap();
    server.start_progress_thread().unwrap();

    let call = client.forward_raw(&server.addr_self(), id, &[1, 2, 3]).unwrap();
    let err = client.wait_reply_raw(&call, 2000).unwrap_err();
    assert_eq!(err.code(), Code::DecodeFailed);
    server.finalize().unwrap();
    assert_eq!(server.live_handles(), 0);
}

#[test]
fn undecodable_input_is_answered_by_process() {
    let fabric = Fabric::new();
    let server = context(&fabric);
    let client = context(&fabric);
    let id = server
        .register::<u64, u64, _>("wide", |h| h.complete(&h.get_input::<u64>()?))
        .unwrap();

    let call = client.forward_raw(&server.addr_self(), id, &[1, 2, 3]).unwrap();
    server.process(1000).unwrap();
    let err = client.wait_reply_raw(&call, 1000).unwrap_err();
    assert_eq!(err.code(), Code::DecodeFailed);
    server.finalize().unwrap();
    assert_eq!(server.live_handles(), 0);
}

#[test]
fn long_error_message_is_cut_to_fit() {
    let fabric = Fabric::with_msg_max_size(256);
    let server = context(&fabric);
    let client = context(&fabric);
    let id = server
        .register::<(), (), _>("verbose", |_| {
            Err(Error::InvalidArgument("x".repeat(1000)))
        })
        .unwrap();

    let call = client.forward(&server.addr_self(), id, &()).unwrap();
    server.process(1000).unwrap();
    let err = client.wait_reply_raw(&call, 1000).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    match err {
        Error::Remote { message, .. } => {
            assert!(message.len() < 256, "{} bytes", message.len());
            assert!(message.starts_with("invalid argument: xxx"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
    server.finalize().unwrap();
    assert_eq!(server.live_handles(), 0);
}

#[test]
fn finalize_barrier() {
    const OPS: [&str; 4] = ["double", "triple", "square", "negate"];
    let fabric = Fabric::new();
    let server = context(&fabric);
    for name in OPS {
        server
            .register::<i64, i64, _>(name, move |h| {
                let v: i64 = h.get_input()?;
                let out = match name {
                    "double" => v * 2,
                    "triple" => v * 3,
                    "square" => v * v,
                    _ => -v,
                };
                h.complete(&out)
            })
            .unwrap();
    }
    let finalize = server.register_finalize(|_| Ok(())).unwrap();
    assert_eq!(finalize, rpc_id(FINALIZE_NAME));
    let addr = server.addr_self();

    thread::scope(|s| {
        for (i, name) in OPS.iter().enumerate() {
            let fabric = &fabric;
            let addr = &addr;
            s.spawn(move |_| {
                let client = context(fabric);
                let v = i as i64 + 2;
                let out: i64 = client.call(addr, rpc_id(name), &v, 5000).unwrap();
                assert_ne!(out, 0);
                client.call::<(), ()>(addr, finalize, &(), 5000).unwrap();
            });
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while server.finalize_count() < OPS.len() {
            assert!(Instant::now() < deadline, "clients never finalized");
            if let Err(e) = server.process(100) {
                assert!(e.is_timeout(), "{}", e);
            }
        }
    })
    .unwrap();

    server.finalize().unwrap();
    assert_eq!(server.live_handles(), 0);
    assert_eq!(server.finalize_count(), OPS.len());
}

#[test]
fn registered_names_resolve_to_their_entries() {
    let fabric = Fabric::new();
    let server = context(&fabric);
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut names = Vec::new();
    for i in 0..64 {
        let suffix: u32 = rng.gen();
        let name = format!("op_{}_{:08x}", i, suffix);
        server
            .register::<(), (), _>(&name, |h| h.complete_empty())
            .unwrap();
        names.push(name);
    }
    for name in &names {
        let entry = server.lookup(rpc_id(name)).unwrap();
        assert_eq!(&*entry.name, name.as_str());
        assert_eq!(entry.id, rpc_id(name));
    }
    assert!(matches!(
        server.lookup(rpc_id("never_registered")),
        Err(Error::UnknownOp(_))
    ));
}

#[test]
fn get_input_is_idempotent() {
    let fabric = Fabric::new();
    let server = context(&fabric);
    let client = context(&fabric);
    let id = server
        .register::<Record, bool, _>("twice", |h| {
            let first: Record = h.get_input()?;
            let second: Record = h.get_input()?;
            h.complete(&(first == second && first.values.len() == 3))
        })
        .unwrap();
    server.start_progress_thread().unwrap();

    let input = Record {
        name: String::from("ferry"),
        values: vec![1, 2, 3],
        note: None,
    };
    let same: bool = client.call(&server.addr_self(), id, &input, 2000).unwrap();
    assert!(same);
    server.finalize().unwrap();
}

#[test]
fn handler_pulls_from_caller() {
    let fabric = Fabric::new();
    let server = context(&fabric);
    let client = context(&fabric);
    let id = server
        .register::<BulkDescriptor, u64, _>("checksum", checksum_handler)
        .unwrap();
    server.start_progress_thread().unwrap();

    let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
    let expected: u64 = data.iter().map(|&b| b as u64).sum();
    let buf = MemBuffer::from_vec(data);
    let desc = BulkDescriptor::create(&client, &buf, 4096, BulkAccess::ReadOnly).unwrap();

    let sum: u64 = client.call(&server.addr_self(), id, &desc, 5000).unwrap();
    assert_eq!(sum, expected);
    desc.free().unwrap();
    server.finalize().unwrap();
    assert_eq!(server.live_handles(), 0);
}

#[test]
fn concurrent_callers_with_nested_waits() {
    const CLIENTS: usize = 4;
    let fabric = Fabric::new();
    let server = context(&fabric);
    let id = server
        .register::<BulkDescriptor, u64, _>("checksum", checksum_handler)
        .unwrap();
    server.start_progress_thread().unwrap();
    let addr = server.addr_self();

    thread::scope(|s| {
        for i in 0..CLIENTS {
            let fabric = &fabric;
            let addr = &addr;
            s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(SEED + i as u64);
                let client = context(fabric);
                for _ in 0..8 {
                    let len = rng.gen_range(1..3000);
                    let mut data = vec![0u8; len];
                    rng.fill_bytes(&mut data);
                    let expected: u64 = data.iter().map(|&b| b as u64).sum();
                    let buf = MemBuffer::from_vec(data);
                    let desc =
                        BulkDescriptor::create(&client, &buf, len as u64, BulkAccess::ReadOnly)
                            .unwrap();
                    let sum: u64 = client.call(addr, id, &desc, 5000).unwrap();
                    assert_eq!(sum, expected);
                }
            });
        }
    })
    .unwrap();

    server.finalize().unwrap();
    assert_eq!(server.live_handles(), 0);
}

#[test]
fn request_to_closed_server_fails() {
    let fabric = Fabric::new();
    let server = context(&fabric);
    let client = context(&fabric);
    let addr = server.addr_self();
    fabric.close(&addr).unwrap();
    let err = client.forward(&addr, rpc_id("anything"), &()).unwrap_err();
    assert_eq!(err.code(), Code::NetworkFailed);
}
