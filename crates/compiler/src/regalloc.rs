//! Register Allocator (spec §4.5): classic Poletto–Sarkar linear scan over
//! the live intervals of one function's (or the top-level frame's) named
//! locals, run after symbol collection and before code generation.
//!
//! Grounded on the teacher's `resolver.rs`-then-`codegen` staging (a
//! separate pre-codegen pass assigns identities/placement before the
//! generator emits anything) — here the placement decision is "register or
//! keep the slot" rather than "slot number", since slots are already final
//! by the time this pass runs.

use crate::ast::{Expr, FStringSegment, Program, Reg, Statement, ThreadCount};
use crate::symbols::{FunctionRecord, Slot, SymbolTable};
use std::collections::{HashMap, HashSet};

/// Callee-saved x86-64 GPRs available to the allocator, in the order spec
/// §4.5 lists the pool (`rbx, r12, r13, r14, r15`). `r15` doubles as the
/// closure-environment pointer (spec §4.6) and is pulled out of the pool
/// for any function with a non-empty capture list.
const POOL_ORDER: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Where the code generator finds a named local's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Register(Reg),
    Spill(Slot),
}

/// Result of allocating one frame (a function body or the top-level
/// program), consumed by the code generator's prologue/epilogue and ident
/// lowering (spec §4.5 "Output", "Prologue/epilogue").
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub locations: HashMap<String, Location>,
    /// Callee-saved registers this frame must push on entry / pop on exit,
    /// in push order.
    pub callee_saved: Vec<Reg>,
    /// Whether an extra `sub rsp, 8` is needed to keep the stack
    /// 16-byte-aligned before `call`, given an odd number of pushes after
    /// the `push rbp`.
    pub stack_padding: bool,
}

/// One local's live interval, expressed in the program points assigned by
/// [`PointWalker`] (one point per statement/expression visited, in
/// execution order).
struct Interval {
    name: String,
    start: usize,
    end: usize,
}

/// Allocates registers for the top-level program frame.
pub fn allocate_top_level(program: &Program, symbols: &SymbolTable) -> Allocation {
    let mut walker = PointWalker::default();
    walker.walk_block(&program.statements);
    allocate_from_walker(&symbols.top_level, walker, &[])
}

/// Allocates registers for one function's frame. `body` is the lambda's
/// body expression; `record.captured` determines whether `r15` is
/// reserved for the closure environment.
pub fn allocate_function(record: &FunctionRecord, body: &Expr) -> Allocation {
    let mut walker = PointWalker::default();
    for p in &record.params {
        walker.touch(p);
    }
    walker.walk_expr(body);
    allocate_from_walker(&record.slots, walker, &record.captured)
}

fn allocate_from_walker(slots: &HashMap<String, Slot>, walker: PointWalker, captured: &[String]) -> Allocation {
    let mut pool: Vec<Reg> = POOL_ORDER.to_vec();
    if !captured.is_empty() {
        pool.retain(|r| *r != Reg::R15);
    }

    let mut intervals: Vec<Interval> = slots
        .keys()
        .map(|name| Interval {
            name: name.clone(),
            start: *walker.first.get(name).unwrap_or(&0),
            end: *walker.last.get(name).unwrap_or(&0),
        })
        .collect();
    intervals.sort_by_key(|iv| iv.start);

    let mut locations = HashMap::new();
    let mut active: Vec<(Reg, usize, String)> = Vec::new(); // (reg, end, name)
    let mut free: Vec<Reg> = pool.clone();
    let mut callee_saved: HashSet<Reg> = HashSet::new();

    for iv in &intervals {
        active.retain(|(reg, end, _)| {
            let alive = *end >= iv.start;
            if !alive {
                free.push(*reg);
            }
            alive
        });

        if walker.forced_spill.contains(&iv.name) {
            locations.insert(iv.name.clone(), Location::Spill(slots[&iv.name]));
            continue;
        }

        if let Some(reg) = free.pop() {
            active.push((reg, iv.end, iv.name.clone()));
            active.sort_by_key(|(_, end, _)| *end);
            locations.insert(iv.name.clone(), Location::Register(reg));
            callee_saved.insert(reg);
        } else {
            // Spill the interval with the latest end among the current
            // interval and the active set (spec §4.5 "spill the interval
            // with the latest end").
            let (worst_idx, worst_end) = active
                .iter()
                .enumerate()
                .max_by_key(|(_, (_, end, _))| *end)
                .map(|(i, (_, end, _))| (i, *end))
                .unwrap_or((0, 0));

            if worst_end > iv.end {
                let (reg, _, spilled_name) = active.remove(worst_idx);
                locations.insert(spilled_name.clone(), Location::Spill(slots[&spilled_name]));
                active.push((reg, iv.end, iv.name.clone()));
                active.sort_by_key(|(_, end, _)| *end);
                locations.insert(iv.name.clone(), Location::Register(reg));
            } else {
                locations.insert(iv.name.clone(), Location::Spill(slots[&iv.name]));
            }
        }
    }

    let mut callee_saved: Vec<Reg> = POOL_ORDER
        .into_iter()
        .filter(|r| callee_saved.contains(r))
        .collect();
    callee_saved.sort_by_key(|r| r.encoding());

    let stack_padding = callee_saved.len() % 2 == 1;

    Allocation {
        locations,
        callee_saved,
        stack_padding,
    }
}

/// Assigns a monotonically increasing program point to each
/// statement/expression visited, in execution order, and records each
/// named local's first and last touch point. Names touched anywhere inside
/// a parallel construct (`@@`/`N @` loop, `spawn`) are marked
/// `forced_spill`: spec §4.5 "parallel-loop bodies fall back to stack
/// allocation for all locals" — `r11`–`r15` belong to the parallel runtime
/// there, so none of this pool is safe to hand out.
#[derive(Default)]
struct PointWalker {
    point: usize,
    first: HashMap<String, usize>,
    last: HashMap<String, usize>,
    forced_spill: HashSet<String>,
    in_parallel: usize,
}

impl PointWalker {
    fn touch(&mut self, name: &str) {
        self.point += 1;
        self.first.entry(name.to_string()).or_insert(self.point);
        self.last.insert(name.to_string(), self.point);
        if self.in_parallel > 0 {
            self.forced_spill.insert(name.to_string());
        }
    }

    fn walk_block(&mut self, stmts: &[Statement]) {
        for s in stmts {
            self.walk_stmt(s);
        }
    }

    fn walk_stmt(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Assignment { name, value, .. } => {
                self.walk_expr(value);
                self.touch(name);
            }
            Statement::TupleAssign { names, value, .. } => {
                self.walk_expr(value);
                for n in names {
                    self.touch(n);
                }
            }
            Statement::ExpressionStmt(e) => self.walk_expr(e),
            Statement::Loop {
                iterator,
                iterable,
                body,
                threads,
                ..
            } => {
                if let Some(it) = iterable {
                    self.walk_expr(it);
                }
                let entering_parallel = threads.is_parallel();
                if entering_parallel {
                    self.in_parallel += 1;
                }
                if let Some(name) = iterator {
                    self.touch(name);
                }
                self.walk_block(body);
                if entering_parallel {
                    self.in_parallel -= 1;
                }
            }
            Statement::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.walk_expr(v);
                }
            }
            Statement::Arena(block, _) => self.walk_block(&block.body),
            Statement::Defer { expr, .. } => self.walk_expr(expr),
            Statement::Spawn { expr, handler, .. } => {
                self.walk_expr(expr);
                self.in_parallel += 1;
                if let Some((params, body)) = handler {
                    for p in params {
                        self.touch(p);
                    }
                    self.walk_block(body);
                }
                self.in_parallel -= 1;
            }
            Statement::CStruct(_) | Statement::Alias { .. } | Statement::Import { .. } | Statement::RegisterAssign(_, _) => {}
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Ident(name, _) | Expr::Move(name, _) => self.touch(name),
            Expr::NamespacedIdent { .. } | Expr::Number(..) | Expr::String(..) | Expr::ErrorExpr(_) | Expr::LoopState { .. } => {}
            Expr::FString(parts, _) => {
                for part in parts {
                    if let FStringSegment::Interpolated(e) = part {
                        self.walk_expr(e);
                    }
                }
            }
            Expr::Binary { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => self.walk_expr(operand),
            Expr::Lambda { .. } | Expr::MultiLambda { .. } => {
                // Nested functions get their own frame and their own
                // allocation pass (`allocate_function`); only free-variable
                // captures reach into this frame, and those are read
                // through the closure environment, not this allocator.
            }
            Expr::Call { args, .. } => {
                for a in args {
                    self.walk_expr(a);
                }
            }
            Expr::DirectCall { callee, args, .. } => {
                self.walk_expr(callee);
                for a in args {
                    self.walk_expr(a);
                }
            }
            Expr::Index { target, index, .. } => {
                self.walk_expr(target);
                self.walk_expr(index);
            }
            Expr::Slice { target, range, .. } => {
                self.walk_expr(target);
                self.walk_expr(range);
            }
            Expr::Range { start, end, step, .. } => {
                for e in [start, end, step].into_iter().flatten() {
                    self.walk_expr(e);
                }
            }
            Expr::List(items, _) | Expr::Vector(items, _) => {
                for i in items {
                    self.walk_expr(i);
                }
            }
            Expr::Map { keys, values, .. } => {
                for k in keys {
                    self.walk_expr(k);
                }
                for v in values {
                    self.walk_expr(v);
                }
            }
            Expr::Block(body, _) => self.walk_block(body),
            Expr::Match { condition, arms, default, .. } => {
                if let Some(c) = condition {
                    self.walk_expr(c);
                }
                for arm in arms {
                    self.walk_expr(&arm.test);
                    self.walk_expr(&arm.result);
                }
                if let Some(d) = default {
                    self.walk_expr(d);
                }
            }
            Expr::Cast { value, .. } => self.walk_expr(value),
            Expr::Length(e, _) => self.walk_expr(e),
            Expr::In { value, collection, .. } => {
                self.walk_expr(value);
                self.walk_expr(collection);
            }
            Expr::Pipe { value, func, .. } => {
                self.walk_expr(value);
                self.walk_expr(func);
            }
            Expr::Parallel { body, .. } => {
                self.in_parallel += 1;
                self.walk_expr(body);
                self.in_parallel -= 1;
            }
            Expr::Send { target, value, .. } => {
                self.walk_expr(target);
                if let Some(v) = value {
                    self.walk_expr(v);
                }
            }
            Expr::Cons { head, tail, .. } => {
                self.walk_expr(head);
                self.walk_expr(tail);
            }
            Expr::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.walk_expr(v);
                }
            }
            Expr::Arena(block, _) => self.walk_block(&block.body),
            Expr::Unsafe { .. } => {}
            Expr::OrElse { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use std::path::PathBuf;

    fn collect(src: &str) -> (Program, SymbolTable) {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        let symbols = crate::symbols::Collector::new().collect(&program);
        (program, symbols)
    }

    #[test]
    fn assigns_registers_to_few_locals() {
        let (program, symbols) = collect("a = 1\nb = 2\nc = a + b\nprintln(c)\n");
        let alloc = allocate_top_level(&program, &symbols);
        assert!(matches!(alloc.locations["a"], Location::Register(_)));
        assert!(matches!(alloc.locations["b"], Location::Register(_)));
        assert!(matches!(alloc.locations["c"], Location::Register(_)));
    }

    #[test]
    fn spills_when_more_locals_than_registers() {
        let src = "a = 1\nb = 2\nc = 3\nd = 4\ne = 5\nf = 6\nprintln(a + b + c + d + e + f)\n";
        let (program, symbols) = collect(src);
        let alloc = allocate_top_level(&program, &symbols);
        let spilled = alloc
            .locations
            .values()
            .filter(|loc| matches!(loc, Location::Spill(_)))
            .count();
        assert!(spilled >= 1);
    }

    #[test]
    fn parallel_loop_locals_are_forced_to_stack() {
        let (program, symbols) = collect("@@ i in 0..10 { atomic_add(counter, 1) }\n");
        let alloc = allocate_top_level(&program, &symbols);
        assert!(matches!(alloc.locations.get("i"), Some(Location::Spill(_))));
    }

    #[test]
    fn odd_register_count_pads_the_stack() {
        let (program, symbols) = collect("a = 1\nb = 2\nc = 3\nprintln(a + b + c)\n");
        let alloc = allocate_top_level(&program, &symbols);
        assert_eq!(alloc.stack_padding, alloc.callee_saved.len() % 2 == 1);
    }
}
