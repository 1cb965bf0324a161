//! The engine driver: runs the instrumented child over each fuzzer-selected
//! input, turns its branch stream into search tasks, and walks the
//! solver/stage state machine one host-fuzzer mutation slot at a time.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, warn};
use speedy::Readable;
use thiserror::Error;

use crate::cov::{CovManager, EdgeCovManager};
use crate::msg::{GepMsg, MemcmpMsg, MsgKind, PipeMsg, GEP_MSG_SIZE, MEMCMP_MSG_SIZE, PIPE_MSG_SIZE};
use crate::shmem::{Label, LabelSource, ShmError, ShmLabelTable, CONST_LABEL};
use crate::solve::constructor::TaskConstructor;
use crate::solve::task::{ConstraintRef, TaskRef};
use crate::solve::{FifoTaskManager, Solver, SolverStatus, TaskManager};
use crate::{HashMap, HashSet, MAX_INPUT_SIZE};

pub(crate) mod child;

pub use child::INPUT_PLACEHOLDER;

/// Address-space reservation for the label table; pages are demand-faulted.
pub const DEFAULT_LABEL_TABLE_BYTES: usize = 0xc_0000_0000; // 48 GiB

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("SYMSAN_TARGET not set; it must point to the instrumented binary")]
    TargetNotSet,
    #[error("failed to create output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },
    #[error("failed to create scratch file {path}: {source}")]
    ScratchFile { path: PathBuf, source: io::Error },
    #[error("label table: {0}")]
    Shm(#[from] ShmError),
    #[error("at least one solver is required")]
    NoSolvers,
}

/// Driver configuration. `from_env` pulls the conventional environment
/// variables; everything is also settable directly for embedding.
#[derive(Debug, Clone)]
pub struct EngineOpts {
    /// Instrumented target binary.
    pub target: PathBuf,
    /// Arguments for the target; [`INPUT_PLACEHOLDER`] slots are replaced by
    /// the scratch-input path.
    pub target_argv: Vec<String>,
    /// Target reads the input from stdin instead of a file argument.
    pub use_stdin: bool,
    /// Where the scratch input lives.
    pub out_dir: PathBuf,
    /// Extension for the scratch file, if the target is picky about names.
    pub file_extension: Option<String>,
    /// Keep the child's stdout/stderr and ask its runtime to log.
    pub debug: bool,
    /// Size of the label-table reservation.
    pub label_table_bytes: usize,
}

impl EngineOpts {
    pub fn new(target: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            target_argv: Vec::new(),
            use_stdin: true,
            out_dir: out_dir.into(),
            file_extension: None,
            debug: false,
            label_table_bytes: DEFAULT_LABEL_TABLE_BYTES,
        }
    }

    /// Reads `SYMSAN_TARGET` (required) and `SYMSAN_OUTPUT_DIR` (defaults to
    /// `<fuzzer_out>/symsan`).
    pub fn from_env(fuzzer_out_dir: &std::path::Path) -> Result<Self, EngineError> {
        let target = std::env::var_os("SYMSAN_TARGET").ok_or(EngineError::TargetNotSet)?;
        let out_dir = std::env::var_os("SYMSAN_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| fuzzer_out_dir.join("symsan"));
        Ok(Self::new(PathBuf::from(target), out_dir))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutationState {
    Invalid,
    InValidation,
    Validated,
}

pub struct Engine {
    pub(crate) opts: EngineOpts,
    scratch_path: PathBuf,
    scratch: File,
    table: ShmLabelTable,

    solvers: Vec<Box<dyn Solver>>,
    pub(crate) task_mgr: Box<dyn TaskManager>,
    cov_mgr: Box<dyn CovManager>,

    pub(crate) fuzzed_inputs: HashSet<u32>,
    pub(crate) cur_queue_entry: Option<String>,
    pub(crate) cur_task: Option<TaskRef>,
    cur_solver_index: usize,
    cur_solver_stage: usize,
    pub(crate) mutation_state: MutationState,
    output_buf: Vec<u8>,

    // per-input caches, cleared before each child run
    expr_cache: HashMap<Label, ConstraintRef>,
    input_dep_cache: HashMap<Label, Rc<HashSet<u32>>>,
    memcmp_cache: HashMap<Label, Vec<u8>>,
}

impl Engine {
    /// Engine with the default FIFO task queue and edge-coverage gate.
    pub fn init(opts: EngineOpts, solvers: Vec<Box<dyn Solver>>) -> Result<Self, EngineError> {
        Self::init_with(
            opts,
            solvers,
            Box::new(FifoTaskManager::new()),
            Box::<EdgeCovManager>::default(),
        )
    }

    pub fn init_with(
        opts: EngineOpts,
        solvers: Vec<Box<dyn Solver>>,
        task_mgr: Box<dyn TaskManager>,
        cov_mgr: Box<dyn CovManager>,
    ) -> Result<Self, EngineError> {
        if solvers.is_empty() {
            return Err(EngineError::NoSolvers);
        }

        std::fs::create_dir_all(&opts.out_dir).map_err(|source| EngineError::OutputDir {
            path: opts.out_dir.clone(),
            source,
        })?;
        let scratch_name = match &opts.file_extension {
            Some(ext) => format!(".cur_input.{ext}"),
            None => ".cur_input".to_owned(),
        };
        let scratch_path = opts.out_dir.join(scratch_name);
        let scratch = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&scratch_path)
            .map_err(|source| EngineError::ScratchFile {
                path: scratch_path.clone(),
                source,
            })?;

        let table = ShmLabelTable::new(opts.label_table_bytes)?;

        Ok(Self {
            opts,
            scratch_path,
            scratch,
            table,
            solvers,
            task_mgr,
            cov_mgr,
            fuzzed_inputs: HashSet::default(),
            cur_queue_entry: None,
            cur_task: None,
            cur_solver_index: 0,
            cur_solver_stage: 0,
            mutation_state: MutationState::Invalid,
            output_buf: Vec::new(),
            expr_cache: HashMap::default(),
            input_dep_cache: HashMap::default(),
            memcmp_cache: HashMap::default(),
        })
    }

    /// Traces one queue entry: runs the child over `buf`, converts every
    /// interesting branch into search tasks, and returns an upper bound on
    /// the mutations the solvers may produce. Each queue-entry id is traced
    /// at most once.
    pub fn fuzz_count(&mut self, input_id: u32, queue_entry: &str, buf: &[u8]) -> u32 {
        if !self.fuzzed_inputs.insert(input_id) {
            return 0;
        }
        if buf.len() > MAX_INPUT_SIZE {
            warn!("input of {} bytes exceeds the staging limit", buf.len());
            return 0;
        }
        self.cur_queue_entry = Some(queue_entry.to_owned());
        debug!("tracing {queue_entry}");

        // caches hold label references from the previous run; the child is
        // about to reuse those labels
        self.expr_cache.clear();
        self.input_dep_cache.clear();
        self.memcmp_cache.clear();

        if let Err(err) = self.stage_input(buf) {
            warn!("failed to stage input: {err}");
            return 0;
        }
        let mut target = match child::spawn_target(&self.opts, &self.scratch_path, self.table.shm_id())
        {
            Ok(target) => target,
            Err(err) => {
                warn!("failed to spawn {}: {err}", self.opts.target.display());
                return 0;
            }
        };

        self.drain_pipe(&mut target.pipe, buf);

        // exit status is irrelevant; crashes simply end the stream
        let _ = target.child.wait();

        self.cur_task = None;
        let max_stages: usize = self.solvers.iter().map(|s| s.stages()).sum();
        (self.task_mgr.num_tasks() * max_stages) as u32
    }

    /// One host-fuzzer mutation slot. Returns the candidate buffer to run:
    /// either a solver-produced mutation or the unchanged input when there is
    /// nothing (left) to try.
    pub fn fuzz<'a>(&'a mut self, buf: &'a [u8]) -> &'a [u8] {
        // move on once the previous candidate was validated, or when idle
        if self.cur_task.is_none() || self.mutation_state == MutationState::Validated {
            let Some(task) = self.task_mgr.get_next_task() else {
                debug!("no more tasks to solve");
                self.cur_task = None;
                return buf;
            };
            self.cur_task = Some(task);
            self.cur_solver_index = 0;
            self.cur_solver_stage = 0;
            self.mutation_state = MutationState::Invalid;
        }

        if self.mutation_state == MutationState::InValidation {
            // the candidate did not validate; try the next stage
            self.cur_solver_stage += 1;
        }

        if self.cur_solver_stage >= self.solvers[self.cur_solver_index].stages() {
            self.cur_solver_index += 1;
            if self.cur_solver_index >= self.solvers.len() {
                let Some(task) = self.task_mgr.get_next_task() else {
                    debug!("no more tasks to solve");
                    self.cur_task = None;
                    return buf;
                };
                self.cur_task = Some(task);
                self.cur_solver_index = 0;
            }
            self.cur_solver_stage = 0;
        }

        let Some(task) = self.cur_task.clone() else {
            return buf;
        };
        self.output_buf.clear();
        let status = self.solvers[self.cur_solver_index].solve(
            self.cur_solver_stage,
            &task,
            buf,
            &mut self.output_buf,
        );
        match status {
            SolverStatus::Sat => {
                debug!("task solved");
                self.mutation_state = MutationState::InValidation;
                &self.output_buf
            }
            SolverStatus::Timeout => {
                self.mutation_state = MutationState::Invalid;
                self.cur_solver_stage += 1;
                buf
            }
            SolverStatus::Unsat => {
                debug!("task not solvable");
                self.cur_task = None;
                buf
            }
        }
    }

    /// Host-fuzzer feedback: a new queue entry derived from the entry we are
    /// mutating means our in-flight candidate reached new coverage. Returns
    /// whether the current task was marked solved.
    pub fn queue_new_entry(&mut self, new_entry: &str, orig_entry: &str) -> bool {
        debug!("new queue entry {new_entry}");
        if self.mutation_state == MutationState::InValidation
            && self.cur_queue_entry.as_deref() == Some(orig_entry)
        {
            self.mutation_state = MutationState::Validated;
            if let Some(task) = &self.cur_task {
                task.borrow_mut().solved = true;
            }
            return true;
        }
        false
    }

    /// The engine's mutations are whole-input solutions; splicing over them
    /// only destroys the solved bytes.
    pub fn splice_optout(&self) {}

    fn stage_input(&mut self, buf: &[u8]) -> io::Result<()> {
        self.scratch.rewind()?;
        self.scratch.write_all(buf)?;
        self.scratch.sync_all()?;
        self.scratch.set_len(buf.len() as u64)?;
        Ok(())
    }

    fn drain_pipe(&mut self, pipe: &mut File, buf: &[u8]) {
        let mut record = [0u8; PIPE_MSG_SIZE];
        loop {
            match read_record(pipe, &mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    warn!("short read on branch pipe: {err}");
                    break;
                }
            }
            let msg = match PipeMsg::read_from_buffer(&record) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("malformed pipe record: {err}");
                    break;
                }
            };
            match MsgKind::from(msg.msg_type) {
                MsgKind::Cond => self.handle_cond(&msg, buf),
                MsgKind::Gep => self.handle_gep(&msg, pipe),
                MsgKind::Memcmp => self.handle_memcmp(&msg, pipe),
                MsgKind::Fsize => {}
                MsgKind::Unknown(kind) => {
                    debug!("ignoring pipe record of unknown type {kind}");
                }
            }
        }
    }

    fn handle_cond(&mut self, msg: &PipeMsg, buf: &[u8]) {
        if msg.label == 0 {
            return;
        }
        let ctx = self
            .cov_mgr
            .add_branch(msg.addr, msg.id, msg.result != 0, msg.context, false, false);
        let neg_ctx = ctx.negated();
        if !self.cov_mgr.is_branch_interesting(&neg_ctx) {
            return;
        }

        let mut constructor = TaskConstructor {
            table: &self.table,
            buf,
            expr_cache: &mut self.expr_cache,
            input_dep_cache: &mut self.input_dep_cache,
            memcmp_cache: &self.memcmp_cache,
        };
        if constructor.input_deps(msg.label).is_empty() {
            debug!("condition at {:#x} has no input dependency", msg.addr);
            return;
        }
        match constructor.construct_tasks(neg_ctx.direction, msg.label) {
            Ok(tasks) => {
                for task in tasks {
                    self.task_mgr.add_task(&neg_ctx, task);
                }
            }
            Err(err) => warn!("dropping branch at {:#x}: {err}", msg.addr),
        }
    }

    /// Array-index records are validated and then dropped; reserved for
    /// array-bounds inference.
    fn handle_gep(&mut self, msg: &PipeMsg, pipe: &mut File) {
        let mut payload = [0u8; GEP_MSG_SIZE];
        if let Err(err) = pipe.read_exact(&mut payload) {
            warn!("failed to receive gep payload: {err}");
            return;
        }
        let gmsg = match GepMsg::read_from_buffer(&payload) {
            Ok(gmsg) => gmsg,
            Err(err) => {
                warn!("malformed gep payload: {err}");
                return;
            }
        };
        if gmsg.index_label != msg.label {
            warn!("gep payload label mismatch: {} vs {}", gmsg.index_label, msg.label);
        }
    }

    fn handle_cmp_content(&mut self, msg: &PipeMsg, pipe: &mut File) -> io::Result<()> {
        let mut payload = vec![0u8; MEMCMP_MSG_SIZE + msg.result as usize];
        pipe.read_exact(&mut payload)?;
        let mmsg = MemcmpMsg::read_from_buffer(&payload[..MEMCMP_MSG_SIZE])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if mmsg.label != msg.label {
            warn!("memcmp payload label mismatch: {} vs {}", mmsg.label, msg.label);
            return Ok(());
        }
        self.memcmp_cache
            .insert(msg.label, payload[MEMCMP_MSG_SIZE..].to_vec());
        Ok(())
    }

    fn handle_memcmp(&mut self, msg: &PipeMsg, pipe: &mut File) {
        let Some(info) = self.table.label_info(msg.label) else {
            warn!("memcmp record with invalid label {}", msg.label);
            return;
        };
        // content is only shipped when one operand is concrete
        if info.l1 != CONST_LABEL && info.l2 != CONST_LABEL {
            return;
        }
        if let Err(err) = self.handle_cmp_content(msg, pipe) {
            warn!("failed to receive memcmp payload: {err}");
        }
    }
}

/// Fills `record` from the pipe. `Ok(false)` is a clean end-of-stream at a
/// record boundary; anything partial is an error.
fn read_record(pipe: &mut File, record: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < record.len() {
        match pipe.read(&mut record[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
