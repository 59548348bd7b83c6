// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vatlog_kernel::delivery::{CapToken, Delivery, DeliveryStatus, Payload};
use vatlog_kernel::error::{KernelError, KernelResult};
use vatlog_kernel::simulator::SyscallSimulator;
use vatlog_kernel::types::{Position, VatId};
use vatlog_kernel::worker::{SyscallHandler, VatWorker, WorkerFactory};
use vatlog_node::{DeliveryReport, Kernel, KernelConfig};

/// Everything the reference worker knows. Snapshots are this, bincode-encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub version: String,
    pub parameters: Vec<u8>,
    pub counters: BTreeMap<String, u64>,
    pub replies: u64,
    pub deliveries: u64,
    pub reaped: u64,
}

/// Deterministic worker: counts messages per target and sends one syscall
/// per message. A message whose body is `reject` reports a vat-level error,
/// and once `no-snapshot` has been messaged the worker refuses to snapshot.
pub struct CounterWorker {
    state: CounterState,
    extra_syscall: bool,
}

impl VatWorker for CounterWorker {
    fn deliver(&mut self, delivery: &Delivery, syscalls: &mut dyn SyscallHandler) -> KernelResult<DeliveryStatus> {
        match delivery {
            Delivery::StartVat { vat_parameters } => {
                self.state.parameters = vat_parameters.0.clone();
                Ok(DeliveryStatus::Ok)
            }
            Delivery::Message { target, body } => {
                self.state.deliveries += 1;
                if body.as_bytes() == b"reject" {
                    return Ok(DeliveryStatus::Error("rejected by vat".into()));
                }
                let count = self.state.counters.entry(target.0.clone()).or_insert(0);
                *count += 1;
                let call = format!("send {} {}", target.0, count);
                let reply = syscalls.syscall(&Payload(call.into_bytes()))?;
                self.state.replies += reply.0.len() as u64;
                if self.extra_syscall {
                    syscalls.syscall(&Payload::from("vatstore-get extra"))?;
                }
                Ok(DeliveryStatus::Ok)
            }
            Delivery::Notify { .. } => {
                self.state.deliveries += 1;
                Ok(DeliveryStatus::Ok)
            }
            Delivery::DropExports { refs } | Delivery::RetireExports { refs } | Delivery::RetireImports { refs } => {
                self.state.deliveries += 1;
                for r in refs {
                    self.state.counters.remove(&r.0);
                }
                Ok(DeliveryStatus::Ok)
            }
            Delivery::BringOutYourDead => {
                self.state.reaped += 1;
                Ok(DeliveryStatus::Ok)
            }
            other => Err(KernelError::WorkerFault(format!("unexpected {}", other.kind().as_str()))),
        }
    }

    fn save_snapshot(&mut self) -> KernelResult<Vec<u8>> {
        if self.state.counters.contains_key("no-snapshot") {
            return Err(KernelError::WorkerFault("snapshot refused".into()));
        }
        bincode::serde::encode_to_vec(&self.state, bincode::config::standard())
            .map_err(|e| KernelError::Encode(e.to_string()))
    }
}

#[derive(Default)]
pub struct TestFactory {
    inits: AtomicUsize,
    loads: AtomicUsize,
    /// Workers make one syscall more than they used to.
    pub extra_syscall: bool,
}

impl TestFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn divergent() -> Arc<Self> {
        Arc::new(Self {
            extra_syscall: true,
            ..Self::default()
        })
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl WorkerFactory for TestFactory {
    fn initialize(&self, _vat: &VatId, options: &Payload) -> KernelResult<Box<dyn VatWorker>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CounterWorker {
            state: CounterState {
                version: String::from_utf8_lossy(options.as_bytes()).into_owned(),
                ..CounterState::default()
            },
            extra_syscall: self.extra_syscall,
        }))
    }

    fn load_snapshot(&self, _vat: &VatId, blob: &[u8]) -> KernelResult<Box<dyn VatWorker>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let (state, _) = bincode::serde::decode_from_slice::<CounterState, _>(blob, bincode::config::standard())
            .map_err(|e| KernelError::InvalidSnapshot(e.to_string()))?;
        Ok(Box::new(CounterWorker {
            state,
            extra_syscall: self.extra_syscall,
        }))
    }
}

/// Live syscall handler: acknowledges every call and remembers it.
#[derive(Default)]
pub struct EchoSyscalls {
    pub effects: Vec<Vec<u8>>,
}

impl SyscallHandler for EchoSyscalls {
    fn syscall(&mut self, call: &Payload) -> KernelResult<Payload> {
        self.effects.push(call.0.clone());
        let mut reply = b"ack:".to_vec();
        reply.extend_from_slice(call.as_bytes());
        Ok(Payload(reply))
    }
}

pub fn vat(name: &str) -> VatId {
    VatId::new(name).unwrap()
}

pub fn message(target: &str, body: &str) -> Delivery {
    Delivery::Message {
        target: CapToken::from(target),
        body: Payload::from(body),
    }
}

pub fn config(dir: &Path, initial: u64, interval: u64) -> KernelConfig {
    let mut cfg = KernelConfig::in_dir(dir);
    cfg.snapshot_initial = initial;
    cfg.snapshot_interval = interval;
    cfg
}

pub fn open_kernel(cfg: &KernelConfig, factory: &Arc<TestFactory>) -> Kernel {
    Kernel::open(cfg.clone(), factory.clone()).unwrap()
}

pub fn create(kernel: &Kernel, name: &str, version: &str) -> VatId {
    let id = vat(name);
    kernel
        .create_vat(&id, Payload::from(version), Payload::from("params"), &mut EchoSyscalls::default())
        .unwrap();
    id
}

pub fn send(kernel: &Kernel, vat: &VatId, n: usize) {
    let mut syscalls = EchoSyscalls::default();
    for i in 0..n {
        let target = format!("o+{}", i % 3);
        kernel.deliver(vat, message(&target, "inc"), &mut syscalls).unwrap();
    }
}

/// Send `n` messages and return the reports together with every syscall the
/// kernel saw while processing them.
pub fn observe(kernel: &Kernel, vat: &VatId, n: usize) -> (Vec<DeliveryReport>, Vec<Vec<u8>>) {
    let mut syscalls = EchoSyscalls::default();
    let reports = (0..n)
        .map(|i| {
            let target = format!("o+{}", i % 2);
            kernel.deliver(vat, message(&target, "inc"), &mut syscalls).unwrap()
        })
        .collect();
    (reports, syscalls.effects)
}

pub fn decode_state(blob: &[u8]) -> CounterState {
    bincode::serde::decode_from_slice::<CounterState, _>(blob, bincode::config::standard())
        .unwrap()
        .0
}

/// State obtained by replaying the whole transcript from position 0,
/// stopping before `until`.
pub fn replay_from_genesis(kernel: &Kernel, vat: &VatId, until: Position) -> CounterState {
    let factory = TestFactory::default();
    let mut worker: Option<Box<dyn VatWorker>> = None;
    for entry in kernel.lifecycle().transcripts().read_full_transcript(vat).unwrap() {
        let entry = entry.unwrap();
        if entry.position >= until {
            break;
        }
        match &entry.delivery {
            Delivery::InitializeWorker { options } => worker = Some(factory.initialize(vat, options).unwrap()),
            Delivery::SaveSnapshot { .. } | Delivery::LoadSnapshot { .. } | Delivery::ShutdownWorker => {}
            delivery => {
                let mut simulator = SyscallSimulator::new(entry.position, &entry.syscalls);
                let status = worker.as_mut().unwrap().deliver(delivery, &mut simulator).unwrap();
                simulator.finish().unwrap();
                assert_eq!(status, entry.status);
            }
        }
    }
    decode_state(&worker.unwrap().save_snapshot().unwrap())
}
