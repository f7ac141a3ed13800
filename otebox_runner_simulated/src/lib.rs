// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Drive the communications core against an in-process simulated secure world.

use anyhow::{Context as _, Result, anyhow, bail, ensure};
use clap::Parser;
use otebox_common::{TeOperParam, TeOperParamCompat, TeServiceId};
use otebox_comms::{
    CallOutcome, CommsConfig, NativeBuffers, ScratchAddressing, SessionOpened, TeError, TeeContext,
    TeeDevice, TransportMode,
};
use std::path::PathBuf;
use tracing::{debug, info};

pub mod commands;
pub mod platform;
pub mod secure_world;

use commands::{Command, Expected, Layout, Param};
use platform::SimulatedPlatform;
use secure_world::SecureWorld;

/// Run a command sequence through the TEE communications core against a simulated secure world
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// JSON-formatted command sequence
    #[arg(required = true, value_hint = clap::ValueHint::FilePath)]
    pub command_sequence: String,
    /// How calls reach the secure world
    #[arg(value_enum, long, default_value = "secure-monitor")]
    pub transport: Transport,
    /// Where native-layout requests are marshaled
    #[arg(value_enum, long = "native-buffers", default_value = "per-call")]
    pub native_buffers: NativeBufferMode,
    /// How compat-layout requests in the registered buffer are addressed
    #[arg(value_enum, long = "compat-addressing", default_value = "offset")]
    pub compat_addressing: Addressing,
    /// Trace every secure call
    #[arg(long = "verbose-smc")]
    pub verbose_smc: bool,
    /// Preempt every N-th request with a simulated interrupt
    #[arg(long = "irq-every", value_name = "N")]
    pub irq_every: Option<u64>,
    /// Logical cpu the client starts on
    #[arg(long, default_value_t = 0)]
    pub cpu: u32,
    /// Run the client as a per-cpu worker that may not change its affinity
    #[arg(long = "pinned-worker")]
    pub pinned_worker: bool,
    /// Increase verbosity (pass multiple times to increase)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Transport {
    /// Raw secure monitor calls from the boot cpu
    SecureMonitor,
    /// A call channel that reports returning calls
    CallChannel,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum NativeBufferMode {
    PerCall,
    Shared,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Addressing {
    Offset,
    Physical,
}

impl CliArgs {
    fn comms_config(&self) -> CommsConfig {
        CommsConfig {
            transport: match self.transport {
                Transport::SecureMonitor => TransportMode::SecureMonitor,
                Transport::CallChannel => TransportMode::CallChannel,
            },
            native_buffers: match self.native_buffers {
                NativeBufferMode::PerCall => NativeBuffers::PerCall,
                NativeBufferMode::Shared => NativeBuffers::Shared,
            },
            compat_addressing: match self.compat_addressing {
                Addressing::Offset => ScratchAddressing::Offset,
                Addressing::Physical => ScratchAddressing::Physical,
            },
            verbose_smc: self.verbose_smc,
        }
    }
}

/// Run every step of the command sequence, failing on the first unexpected result.
pub fn run(cli_args: &CliArgs) -> Result<()> {
    let commands: Vec<Command> = {
        let json_path = PathBuf::from(&cli_args.command_sequence);
        let json_str = std::fs::read_to_string(&json_path)
            .with_context(|| format!("reading {}", json_path.display()))?;
        serde_json::from_str(&json_str)?
    };

    platform::set_current_thread(cli_args.cpu, !cli_args.pinned_worker);
    let config = cli_args.comms_config();
    let platform = SimulatedPlatform::new(
        SecureWorld::new(cli_args.irq_every),
        config.transport == TransportMode::CallChannel,
    );
    let device = TeeDevice::new(platform, config).context("bringing up the tee device")?;

    let mut client = Client::new(&device);
    for (step, command) in commands.iter().enumerate() {
        debug!(step, ?command, "executing");
        client
            .execute(command)
            .with_context(|| format!("step {step} ({command:?})"))?;
    }
    drop(client);

    let platform = device.platform();
    ensure!(
        platform.pinned_pages() == 0,
        "{} pages still pinned after the client went away",
        platform.pinned_pages()
    );
    ensure!(
        platform.off_boot_calls() == 0,
        "{} secure monitor calls were issued off the boot cpu",
        platform.off_boot_calls()
    );
    info!(
        steps = commands.len(),
        storage_requests = platform.storage_requests(),
        dirtied_pages = platform.dirtied_pages(),
        "command sequence completed"
    );
    Ok(())
}

/// One client of the device, plus the memory its persistent buffers live in.
struct Client<'d> {
    device: &'d TeeDevice<SimulatedPlatform>,
    context: TeeContext<'d, SimulatedPlatform>,
    /// Dropped after `context`, which releases the sessions pinning these.
    retained: Vec<Vec<u8>>,
}

/// Parameters marshaled in one of the two layouts, referring into `buffers`.
enum Marshaled {
    Native(Vec<TeOperParam>),
    Compat(Vec<TeOperParamCompat>),
}

impl Marshaled {
    fn new(layout: Layout, params: &[Param], buffers: &mut [Vec<u8>]) -> Result<Self> {
        let mut native = Vec::with_capacity(params.len());
        for (i, (param, buffer)) in params.iter().zip(buffers.iter_mut()).enumerate() {
            let (base_or_value, len) = match param {
                Param::IntRo { value } | Param::IntRw { value, .. } => (*value as usize, 0),
                Param::Raw { .. } => (0, 0),
                Param::MemRo { .. }
                | Param::MemRw { .. }
                | Param::PersistMemRo { .. }
                | Param::PersistMemRw { .. } => (
                    buffer.as_mut_ptr().expose_provenance(),
                    u32::try_from(buffer.len())?,
                ),
            };
            native.push(TeOperParam {
                index: u32::try_from(i)?,
                param_type: param.type_code(),
                base_or_value,
                len,
                ..TeOperParam::default()
            });
        }
        Ok(match layout {
            Layout::Native => Self::Native(native),
            Layout::Compat => Self::Compat(
                native
                    .iter()
                    .map(|p| TeOperParamCompat {
                        index: p.index,
                        param_type: p.param_type,
                        base_or_value: p.base_or_value as u64,
                        len: p.len,
                        ..TeOperParamCompat::default()
                    })
                    .collect(),
            ),
        })
    }

    fn value(&self, index: usize) -> u32 {
        match self {
            Self::Native(params) => params[index].base_or_value as u32,
            Self::Compat(params) => params[index].base_or_value as u32,
        }
    }
}

fn buffers_for(params: &[Param]) -> Vec<Vec<u8>> {
    params
        .iter()
        .map(|param| match param {
            Param::MemRo { data } | Param::MemRw { data, .. } => data.as_bytes().to_vec(),
            Param::PersistMemRo { size } | Param::PersistMemRw { size } => vec![0; *size],
            Param::IntRo { .. } | Param::IntRw { .. } | Param::Raw { .. } => Vec::new(),
        })
        .collect()
}

fn result_code(outcome: &Result<CallOutcome, TeError>) -> u32 {
    match outcome {
        Ok(outcome) => outcome.result,
        Err(err) => err.code(),
    }
}

fn check_result(result: u32, expect: Expected) -> Result<()> {
    ensure!(
        result == expect.code(),
        "expected {expect:?} ({:#x}), got {result:#x}",
        expect.code()
    );
    Ok(())
}

/// Compare what the secure world wrote back against the expectations on each parameter.
fn check_outputs(params: &[Param], marshaled: &Marshaled, buffers: &[Vec<u8>]) -> Result<()> {
    for (i, param) in params.iter().enumerate() {
        match param {
            Param::IntRw {
                expect: Some(expected),
                ..
            } => {
                let value = marshaled.value(i);
                ensure!(value == *expected, "param {i}: expected {expected}, got {value}");
            }
            Param::MemRw {
                expect: Some(expected),
                ..
            } => {
                let data = String::from_utf8_lossy(&buffers[i]);
                ensure!(
                    data == expected.as_str(),
                    "param {i}: expected {expected:?}, got {data:?}"
                );
            }
            _ => {}
        }
    }
    Ok(())
}

impl<'d> Client<'d> {
    fn new(device: &'d TeeDevice<SimulatedPlatform>) -> Self {
        Self {
            device,
            context: device.open_context(),
            retained: Vec::new(),
        }
    }

    fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::OpenSession {
                service,
                layout,
                params,
                expect,
                expect_session,
            } => {
                let service: TeServiceId = service
                    .parse()
                    .map_err(|_| anyhow!("invalid service id {service:?}"))?;
                let mut buffers = buffers_for(params);
                let mut marshaled = Marshaled::new(*layout, params, &mut buffers)?;
                let opened = match &mut marshaled {
                    Marshaled::Native(p) => self.context.open_session(service, p),
                    Marshaled::Compat(p) => self.context.open_session_compat(service, p),
                };
                let result = match &opened {
                    Ok(opened) => opened.outcome.result,
                    Err(err) => err.code(),
                };
                check_result(result, *expect)?;
                if let Ok(SessionOpened {
                    session_id,
                    outcome,
                }) = opened
                    && outcome.is_success()
                {
                    info!(session_id, "session opened");
                    if let Some(expected) = expect_session {
                        ensure!(
                            session_id == *expected,
                            "expected session {expected}, got {session_id}"
                        );
                    }
                    check_outputs(params, &marshaled, &buffers)?;
                    self.retained.extend(buffers);
                }
            }
            Command::CloseSession {
                session,
                layout,
                expect,
            } => {
                let outcome = match layout {
                    Layout::Native => self.context.close_session(*session),
                    Layout::Compat => self.context.close_session_compat(*session),
                };
                check_result(result_code(&outcome), *expect)?;
            }
            Command::LaunchOperation {
                session,
                command,
                layout,
                params,
                expect,
            } => {
                let mut buffers = buffers_for(params);
                let mut marshaled = Marshaled::new(*layout, params, &mut buffers)?;
                let outcome = match &mut marshaled {
                    Marshaled::Native(p) => self.context.launch_operation(*session, *command, p),
                    Marshaled::Compat(p) => {
                        self.context.launch_operation_compat(*session, *command, p)
                    }
                };
                check_result(result_code(&outcome), *expect)?;
                if outcome.is_ok_and(|o| o.is_success()) {
                    check_outputs(params, &marshaled, &buffers)?;
                    self.retained.extend(buffers);
                }
            }
            Command::ProgramProtectedRegion { base, size, expect } => {
                let result = match self.device.program_protected_region(*base, *size) {
                    Ok(()) => otebox_common::OteResult::Success.into(),
                    Err(err) => err.code(),
                };
                check_result(result, *expect)?;
            }
            Command::Check {
                sessions,
                pinned_pages,
            } => {
                if let Some(expected) = sessions {
                    let ids = self.context.sessions().ids();
                    ensure!(ids == *expected, "expected sessions {expected:?}, got {ids:?}");
                }
                if let Some(expected) = pinned_pages {
                    let pinned = self.device.platform().pinned_pages();
                    if pinned != *expected {
                        bail!("expected {expected} pinned pages, got {pinned}");
                    }
                }
            }
        }
        Ok(())
    }
}
