//! End-to-end scenarios over hand-built label tables, plus driver state
//! machine tests with a scripted solver.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cov::BranchContext;
use crate::driver::{Engine, EngineOpts, MutationState};
use crate::expr::{AstKind, AstNode};
use crate::shmem::{icmp_op, op, pred, Label, LabelInfo, VecLabelTable};
use crate::solve::constructor::TaskConstructor;
use crate::solve::task::{SearchTask, TaskRef};
use crate::solve::{Solver, SolverStatus};
use crate::{HashMap, HashSet};

pub(crate) struct TableBuilder {
    infos: Vec<LabelInfo>,
}

impl TableBuilder {
    pub(crate) fn new() -> Self {
        // slot 0 is the literal label
        Self {
            infos: vec![LabelInfo::default()],
        }
    }

    fn push(&mut self, info: LabelInfo) -> Label {
        self.infos.push(info);
        (self.infos.len() - 1) as Label
    }

    /// Input-byte terminal at `offset`.
    pub(crate) fn read(&mut self, offset: u64) -> Label {
        self.push(LabelInfo {
            op: 0,
            size: 8,
            op1: offset,
            ..LabelInfo::default()
        })
    }

    /// Multi-byte read starting at `first_byte`'s offset.
    pub(crate) fn load(&mut self, first_byte: Label, len: u32) -> Label {
        self.push(LabelInfo {
            op: op::LOAD,
            size: (len * 8) as u16,
            l1: first_byte,
            l2: len,
            ..LabelInfo::default()
        })
    }

    pub(crate) fn zext(&mut self, value: Label, bits: u16) -> Label {
        self.push(LabelInfo {
            op: op::ZEXT,
            size: bits,
            l1: value,
            ..LabelInfo::default()
        })
    }

    pub(crate) fn binop(
        &mut self,
        raw_op: u16,
        l1: Label,
        l2: Label,
        size: u16,
        op1: u64,
        op2: u64,
    ) -> Label {
        self.push(LabelInfo {
            op: raw_op,
            size,
            l1,
            l2,
            op1,
            op2,
        })
    }

    /// Comparison; `size` is the operand width in bits.
    pub(crate) fn icmp(
        &mut self,
        predicate: u16,
        l1: Label,
        l2: Label,
        size: u16,
        op1: u64,
        op2: u64,
    ) -> Label {
        self.binop(icmp_op(predicate), l1, l2, size, op1, op2)
    }

    /// memcmp result record with a concrete right operand.
    pub(crate) fn memcmp(&mut self, sym: Label, len: u64) -> Label {
        self.push(LabelInfo {
            op: op::MEMCMP,
            size: 32,
            l1: sym,
            l2: 0,
            op1: 0,
            op2: len,
        })
    }

    pub(crate) fn build(self) -> VecLabelTable {
        VecLabelTable(self.infos)
    }
}

struct Pipeline {
    table: VecLabelTable,
    expr_cache: HashMap<Label, crate::solve::task::ConstraintRef>,
    input_dep_cache: HashMap<Label, Rc<HashSet<u32>>>,
    memcmp_cache: HashMap<Label, Vec<u8>>,
}

impl Pipeline {
    fn new(table: VecLabelTable) -> Self {
        Self {
            table,
            expr_cache: HashMap::default(),
            input_dep_cache: HashMap::default(),
            memcmp_cache: HashMap::default(),
        }
    }

    fn construct_tasks(&mut self, direction: bool, label: Label, buf: &[u8]) -> Vec<TaskRef> {
        let mut ctor = TaskConstructor {
            table: &self.table,
            buf,
            expr_cache: &mut self.expr_cache,
            input_dep_cache: &mut self.input_dep_cache,
            memcmp_cache: &self.memcmp_cache,
        };
        ctor.construct_tasks(direction, label).unwrap()
    }

    fn input_deps(&mut self, label: Label) -> Rc<HashSet<u32>> {
        let mut ctor = TaskConstructor {
            table: &self.table,
            buf: &[],
            expr_cache: &mut self.expr_cache,
            input_dep_cache: &mut self.input_dep_cache,
            memcmp_cache: &self.memcmp_cache,
        };
        ctor.input_deps(label)
    }
}

#[test]
fn single_byte_equality_negates_to_distinct() {
    // if (x == 0x41), branch observed taken; drive the untaken side
    let mut tb = TableBuilder::new();
    let x = tb.read(0);
    let cmp = tb.icmp(pred::EQ, x, 0, 8, 0, 0x41);
    let mut pipeline = Pipeline::new(tb.build());

    let tasks = pipeline.construct_tasks(false, cmp, &[0x00]);
    assert_eq!(tasks.len(), 1);
    let task = tasks[0].borrow();
    assert_eq!(task.constraints.len(), 1);
    assert_eq!(task.comparisons, vec![AstKind::Distinct]);
    assert_eq!(task.inputs, vec![(0, 0x00)]);

    let constraint = &task.constraints[0];
    assert_eq!(constraint.ast.kind(), AstKind::Distinct);
    assert_eq!(constraint.comparison, AstKind::Distinct);
    assert_eq!(constraint.const_num, 1);
    // one symbolic slot and one constant slot
    assert_eq!(constraint.input_args.len(), 2);
    assert_eq!(constraint.input_args[1], (false, 0x41));
    assert!(task.has_finalized());
}

#[test]
fn conjunction_negation_splits_into_one_task_per_side() {
    // if ((x & 0xff) == 0x41 && (y & 0xff) == 0x42), both held; negating
    // yields !A || !B, one independently solvable task per side
    let mut tb = TableBuilder::new();
    let x = tb.read(0);
    let y = tb.read(1);
    let zx = tb.zext(x, 32);
    let zy = tb.zext(y, 32);
    let ax = tb.binop(op::AND, zx, 0, 32, 0, 0xff);
    let ay = tb.binop(op::AND, zy, 0, 32, 0, 0xff);
    let ca = tb.icmp(pred::EQ, ax, 0, 32, 0, 0x41);
    let cb = tb.icmp(pred::EQ, ay, 0, 32, 0, 0x42);
    let cond = tb.binop(op::AND, ca, cb, 1, 0, 0);
    let mut pipeline = Pipeline::new(tb.build());

    let tasks = pipeline.construct_tasks(false, cond, b"\x00\x00");
    assert_eq!(tasks.len(), 2);

    let mut seen = Vec::new();
    for task in &tasks {
        let task = task.borrow();
        assert_eq!(task.constraints.len(), 1);
        assert_eq!(task.comparisons, vec![AstKind::Distinct]);
        assert_eq!(task.inputs.len(), 1);
        seen.push(task.inputs[0].0);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1]);
}

#[test]
fn zext_of_bool_is_stripped_and_demorganed() {
    // if (((x == 0) | (y == 0)) == 0): the 1-bit or is widened before the
    // compare, the widening is stripped, and asking for the true side yields
    // x != 0 && y != 0 as a single clause
    let mut tb = TableBuilder::new();
    let x = tb.read(0);
    let y = tb.read(1);
    let cx = tb.icmp(pred::EQ, x, 0, 8, 0, 0);
    let cy = tb.icmp(pred::EQ, y, 0, 8, 0, 0);
    let orv = tb.binop(op::OR, cx, cy, 1, 0, 0);
    let widened = tb.zext(orv, 8);
    let outer = tb.icmp(pred::EQ, widened, 0, 8, 0, 0);
    let mut pipeline = Pipeline::new(tb.build());

    let tasks = pipeline.construct_tasks(true, outer, b"\x05\x07");
    assert_eq!(tasks.len(), 1);
    let task = tasks[0].borrow();
    assert_eq!(task.constraints.len(), 2);
    assert_eq!(task.comparisons, vec![AstKind::Distinct, AstKind::Distinct]);

    let mut offsets: Vec<u32> = task.inputs.iter().map(|&(off, _)| off).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 1]);

    // every symbolic slot is bound to a global index whose initial value
    // matches the constraint's own snapshot
    for (i, cm) in task.consmeta.iter().enumerate() {
        let constraint = &task.constraints[i];
        for (&offset, &local_idx) in &constraint.local_map {
            let (is_symbolic, global_idx) = cm.input_args[local_idx as usize];
            assert!(is_symbolic);
            let (global_off, value) = task.inputs[global_idx as usize];
            assert_eq!(global_off, offset);
            assert_eq!(value, constraint.inputs[&offset]);
        }
    }
}

#[test]
fn zext_chain_over_one_bit_conjunction_strips_to_the_boolean() {
    // if ((x == 5 && y == 9) != 0), with the 1-bit conjunction widened twice
    // before the compare. Stripping must hand back the conjunction itself,
    // so both comparisons survive into one clause.
    let mut tb = TableBuilder::new();
    let x = tb.read(0);
    let y = tb.read(1);
    let cx = tb.icmp(pred::EQ, x, 0, 8, 0, 5);
    let cy = tb.icmp(pred::EQ, y, 0, 8, 0, 9);
    let land = tb.binop(op::AND, cx, cy, 1, 0, 0);
    let wide16 = tb.zext(land, 16);
    let wide32 = tb.zext(wide16, 32);
    let outer = tb.icmp(pred::NE, wide32, 0, 32, 0, 0);
    let mut pipeline = Pipeline::new(tb.build());

    let tasks = pipeline.construct_tasks(true, outer, b"\x00\x00");
    assert_eq!(tasks.len(), 1);
    let task = tasks[0].borrow();
    assert_eq!(task.constraints.len(), 2);
    assert_eq!(task.comparisons, vec![AstKind::Equal, AstKind::Equal]);

    let mut offsets: Vec<u32> = task.inputs.iter().map(|&(off, _)| off).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 1]);
}

#[test]
fn memcmp_against_known_content_becomes_copy_constraint() {
    // if (memcmp(buf, "HELO", 4) == 0); the runtime shipped the constant
    // operand's bytes right before the branch record
    let mut tb = TableBuilder::new();
    let b0 = tb.read(0);
    let ld = tb.load(b0, 4);
    let mc = tb.memcmp(ld, 4);
    let cmp = tb.icmp(pred::EQ, mc, 0, 32, 0, 0);
    let mut pipeline = Pipeline::new(tb.build());
    pipeline.memcmp_cache.insert(mc, b"HELO".to_vec());

    let tasks = pipeline.construct_tasks(true, cmp, b"\x00\x00\x00\x00");
    assert_eq!(tasks.len(), 1);
    {
        let task = tasks[0].borrow();
        assert_eq!(task.comparisons, vec![AstKind::Memcmp]);
        let constraint = &task.constraints[0];
        assert_eq!(constraint.comparison, AstKind::Memcmp);
        assert_eq!(constraint.memcmp_data.as_deref(), Some(&b"HELO"[..]));
        assert_eq!(constraint.local_map.len(), 4);
        // the whole buffer is one input-to-state candidate run
        assert_eq!(task.consmeta[0].i2s_candidates, vec![(0, 4)]);
        // memcmp constraints stay out of the gradient map
        assert!(task.cmap.is_empty());
        assert_eq!(task.shapes.get(&0), Some(&4));
    }

    // the cached constraint serves the opposite direction as a mismatch task
    let tasks = pipeline.construct_tasks(false, cmp, b"\x00\x00\x00\x00");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].borrow().comparisons, vec![AstKind::MemcmpN]);
}

#[test]
fn structural_hash_ignores_label_numbering() {
    // same structure, different label ids: the hashes must agree
    let build = |padding: usize| {
        let mut tb = TableBuilder::new();
        for _ in 0..padding {
            tb.read(9);
        }
        let x = tb.read(0);
        let cmp = tb.icmp(pred::ULT, x, 0, 8, 0, 0x10);
        let mut pipeline = Pipeline::new(tb.build());
        let tasks = pipeline.construct_tasks(true, cmp, &[0x55]);
        let hash = tasks[0].borrow().constraints[0].ast.hash();
        hash
    };
    assert_eq!(build(0), build(5));
}

#[test]
fn shape_groups_cover_distinct_offsets() {
    // two disjoint read groups: the nonzero shape widths sum to the number
    // of distinct symbolic offsets
    let mut tb = TableBuilder::new();
    let b4 = tb.read(4);
    let wide = tb.load(b4, 2);
    let narrow = tb.read(9);
    let zn = tb.zext(narrow, 16);
    let sum = tb.binop(op::ADD, wide, zn, 16, 0, 0);
    let cmp = tb.icmp(pred::EQ, sum, 0, 16, 0, 0x1234);
    let mut pipeline = Pipeline::new(tb.build());

    let buf = [0u8; 16];
    let tasks = pipeline.construct_tasks(true, cmp, &buf);
    let task = tasks[0].borrow();
    let constraint = &task.constraints[0];
    let width_sum: u32 = constraint
        .local_map
        .keys()
        .filter_map(|off| constraint.shapes.get(off))
        .filter(|&&w| w != 0)
        .sum();
    assert_eq!(width_sum, constraint.local_map.len() as u32);
    assert_eq!(constraint.local_map.len(), 3);
}

#[test]
fn relational_leaves_are_flat_after_root_extraction() {
    use crate::expr::roots::RootFinder;

    let mut tb = TableBuilder::new();
    let x = tb.read(0);
    let y = tb.read(1);
    let cx = tb.icmp(pred::SLT, x, 0, 8, 0, 3);
    let cy = tb.icmp(pred::UGE, y, 0, 8, 0, 7);
    let cond = tb.binop(op::AND, cx, cy, 1, 0, 0);
    let table = tb.build();

    let (root, added) = RootFinder::new(&table).find_roots(cond).unwrap();
    assert!(added);
    fn check(node: &AstNode) {
        if node.kind().is_relational() {
            assert!(node.children().is_empty(), "nested relational leaf");
            assert_ne!(node.label(), 0);
        } else {
            for child in node.children() {
                check(child);
            }
        }
    }
    check(&root);
}

#[test]
fn input_deps_cover_reads_and_fold_constants() {
    let mut tb = TableBuilder::new();
    let x = tb.read(2);
    let b5 = tb.read(5);
    let ld = tb.load(b5, 2);
    let zx = tb.zext(x, 16);
    let sum = tb.binop(op::ADD, zx, ld, 16, 0, 0);
    let cmp = tb.icmp(pred::EQ, sum, 0, 16, 0, 1);
    let mut pipeline = Pipeline::new(tb.build());

    let deps = pipeline.input_deps(cmp);
    let mut deps: Vec<u32> = deps.iter().copied().collect();
    deps.sort_unstable();
    assert_eq!(deps, vec![2, 5, 6]);
    // memoized: second query hits the cache
    assert_eq!(pipeline.input_deps(cmp).len(), 3);
}

#[derive(Clone)]
struct ScriptedSolver {
    plan: Vec<SolverStatus>,
    log: Rc<RefCell<Vec<usize>>>,
}

impl ScriptedSolver {
    fn new(plan: Vec<SolverStatus>) -> Self {
        Self {
            plan,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl Solver for ScriptedSolver {
    fn stages(&self) -> usize {
        self.plan.len()
    }

    fn solve(
        &mut self,
        stage: usize,
        task: &TaskRef,
        input: &[u8],
        out: &mut Vec<u8>,
    ) -> SolverStatus {
        self.log.borrow_mut().push(stage);
        let status = self.plan[stage];
        if status == SolverStatus::Sat {
            out.extend_from_slice(input);
            out[0] = 0x41;
            task.borrow_mut().solution.insert(0, 0x41);
        }
        status
    }
}

fn test_engine(solver: ScriptedSolver) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = EngineOpts::new("/bin/true", dir.path().join("symsan"));
    opts.use_stdin = false;
    // tests do not need the full label universe
    opts.label_table_bytes = 1 << 20;
    let solvers: Vec<Box<dyn Solver>> = vec![Box::new(solver)];
    (Engine::init(opts, solvers).unwrap(), dir)
}

fn inject_task(engine: &mut Engine) -> TaskRef {
    let task: TaskRef = Rc::new(RefCell::new(SearchTask::default()));
    engine
        .task_mgr
        .add_task(&BranchContext::default(), task.clone());
    task
}

#[test]
fn repeated_queue_ids_trace_only_once() {
    let solver = ScriptedSolver::new(vec![SolverStatus::Unsat]);
    let (mut engine, _dir) = test_engine(solver);

    // /bin/true emits no branch records, so no tasks either way
    assert_eq!(engine.fuzz_count(7, "id:000007", b"AAAA"), 0);
    assert_eq!(engine.fuzz_count(7, "id:000007", b"AAAA"), 0);
    assert_eq!(engine.fuzzed_inputs.len(), 1);
}

#[test]
fn multi_stage_solver_emits_candidate_once_until_validation() {
    let solver = ScriptedSolver::new(vec![
        SolverStatus::Timeout,
        SolverStatus::Timeout,
        SolverStatus::Sat,
    ]);
    let log = solver.log.clone();
    let (mut engine, _dir) = test_engine(solver);
    inject_task(&mut engine);

    let buf = b"\x00\x00";
    assert_eq!(engine.fuzz(buf), buf); // stage 0 times out
    assert_eq!(engine.fuzz(buf), buf); // stage 1 times out
    let candidate = engine.fuzz(buf).to_vec(); // stage 2 solves
    assert_eq!(candidate, b"\x41\x00");
    assert_eq!(*log.borrow(), vec![0, 1, 2]);

    // no validation feedback: the stage budget is spent, nothing more comes
    assert_eq!(engine.fuzz(buf), buf);
    assert_eq!(*log.borrow(), vec![0, 1, 2]);
    assert!(engine.cur_task.is_none());
}

#[test]
fn validation_marks_task_solved() {
    let solver = ScriptedSolver::new(vec![SolverStatus::Sat]);
    let (mut engine, _dir) = test_engine(solver);
    let task = inject_task(&mut engine);
    engine.cur_queue_entry = Some("id:000000".to_owned());

    let buf = b"\x00";
    assert_eq!(engine.fuzz(buf), b"\x41");
    assert_eq!(engine.mutation_state, MutationState::InValidation);

    // a new queue entry derived from some other seed is not ours
    assert!(!engine.queue_new_entry("id:000009", "id:000432"));
    assert!(engine.queue_new_entry("id:000010", "id:000000"));
    assert_eq!(engine.mutation_state, MutationState::Validated);
    assert!(task.borrow().solved);

    // validated: the engine moves on (queue is empty)
    assert_eq!(engine.fuzz(buf), buf);
    assert!(engine.cur_task.is_none());
}

#[test]
fn unsat_drops_the_task() {
    let solver = ScriptedSolver::new(vec![SolverStatus::Unsat, SolverStatus::Sat]);
    let log = solver.log.clone();
    let (mut engine, _dir) = test_engine(solver);
    inject_task(&mut engine);

    let buf = b"\x00";
    assert_eq!(engine.fuzz(buf), buf);
    assert_eq!(*log.borrow(), vec![0]); // stage 1 never runs
    assert!(engine.cur_task.is_none());
}
