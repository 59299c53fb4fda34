// kernel.rs — Device kernel synthesizer
//
// Emits `op_cuda_<name>`, the global kernel that walks the iteration set
// and calls the per-element body.
//
// Direct loops: a grid-stride loop, one element per thread per step, no
// barriers (only the reduction routines synchronize).
//
// Indirect loops: one plan block per thread block. Thread 0 loads the
// block's plan record; every thread caches its element's map addresses
// once. Colored loops then run colour by colour: elements of the current
// colour compute, the block waits, the same elements scatter their
// `INC`/`RW` results, the block waits again. Indirect writes therefore only
// ever happen between the two barriers of their own colour.
//
// Preconditions: `layout` was planned from `desc`.
// Postconditions: `launch_args` lists kernel formals in exactly the order
//                 the declarations and the host launch use.
// Failure modes: none (all failures are raised by the planner).
// Side effects: none.

use crate::config::GenOptions;
use crate::descriptor::{Access, ArgumentDescriptor, KernelDescriptor};
use crate::emit::Emitter;
use crate::layout::{ArgPlan, LoopLayout, Realisation};
use crate::reduction;

/// One kernel formal and the host expression passed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArg {
    pub formal: String,
    pub actual: String,
}

impl LaunchArg {
    fn new(formal: impl Into<String>, actual: impl Into<String>) -> Self {
        LaunchArg {
            formal: formal.into(),
            actual: actual.into(),
        }
    }
}

pub fn kernel_name(desc: &KernelDescriptor) -> String {
    format!("op_cuda_{}", desc.name)
}

pub fn body_name(desc: &KernelDescriptor) -> String {
    format!("{}_gpu", desc.name)
}

/// Kernel formals in launch order: flag word, indirect datasets, maps,
/// direct datasets, globals, then the plan arrays.
pub fn launch_args(desc: &KernelDescriptor, layout: &LoopLayout) -> Vec<LaunchArg> {
    let name = &layout.name;
    let mut out = Vec::new();
    if layout.optional_bits > 0 {
        out.push(LaunchArg::new("optflags", "optflags"));
    }
    for g in &layout.groups {
        let n = g.representative + 1;
        if layout.args[g.representative].runtime_dim {
            out.push(LaunchArg::new(format!("opDat{}Dim", n), format!("opArg{}%dim", n)));
        }
        let dat = format!("opDat{}Device{}", n, name);
        out.push(LaunchArg::new(dat.clone(), dat));
    }
    for t in &layout.tables {
        out.push(LaunchArg::new(
            format!("opMap{}", t.id.ordinal()),
            format!("opMap{}Device{}", t.id.ordinal(), name),
        ));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        if !arg.is_direct() {
            continue;
        }
        let n = i + 1;
        if layout.args[i].runtime_dim {
            out.push(LaunchArg::new(format!("opDat{}Dim", n), format!("opArg{}%dim", n)));
        }
        let dat = format!("opDat{}Device{}", n, name);
        out.push(LaunchArg::new(dat.clone(), dat));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        if !arg.is_global() {
            continue;
        }
        let n = i + 1;
        let plan = &layout.args[i];
        if plan.runtime_dim {
            out.push(LaunchArg::new(format!("opDat{}Dim", n), format!("opArg{}%dim", n)));
        }
        if arg.reduction_op().is_some() {
            out.push(LaunchArg::new(
                format!("reductionArrayDevice{}", n),
                format!("reductionArrayDevice{}{}", n, name),
            ));
            if plan.runtime_dim {
                let s = format!("scratchDevice{}", n);
                out.push(LaunchArg::new(s.clone(), s));
            }
        } else if arg.access == Access::Read && arg.dim.is_scalar() {
            out.push(LaunchArg::new(
                format!("opGblDat{}Device{}", n, name),
                format!("opDat{}Host", n),
            ));
        }
    }
    if layout.is_indirect() {
        for p in ["pblkMap", "poffset", "pnelems", "pnthrcol", "pthrcol"] {
            out.push(LaunchArg::new(p, p));
        }
        if layout.reorder {
            out.push(LaunchArg::new("pcol_reord", "pcol_reord"));
        }
        out.push(LaunchArg::new("setSize", "set%setPtr%size + set%setPtr%exec_size"));
        out.push(LaunchArg::new("blockOffset", "blockOffset"));
    } else {
        out.push(LaunchArg::new("setSize", "set%setPtr%size"));
    }
    out
}

pub fn emit_kernel(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout, opts: &GenOptions) {
    let formals: Vec<String> = launch_args(desc, layout).into_iter().map(|a| a.formal).collect();
    e.comment("CUDA kernel function");
    e.continued(format!("attributes (global) SUBROUTINE {}(", kernel_name(desc)), &formals, ")");
    e.indent();
    e.blank();
    e.line("IMPLICIT NONE");
    e.blank();
    emit_declarations(e, desc, layout);
    e.blank();

    if layout.unknown_reduction_scratch {
        e.line("thrIdx = threadIdx%x - 1 + (blockIdx%x - 1) * blockDim%x");
    }
    for (arg, plan) in desc.args.iter().zip(&layout.args) {
        reduction::emit_thread_init(e, layout, arg, plan);
    }
    e.blank();

    if layout.is_indirect() {
        emit_indirect_loop(e, desc, layout);
    } else {
        emit_direct_loop(e, desc, layout);
    }

    let reduced: Vec<(&ArgumentDescriptor, &ArgPlan)> = desc
        .args
        .iter()
        .zip(&layout.args)
        .filter(|(a, _)| a.reduction_op().is_some())
        .collect();
    if !reduced.is_empty() {
        e.blank();
        e.comment("reduce each thread's contributions into this block's slot");
        for (arg, plan) in reduced {
            reduction::emit_block_reduce(e, layout, arg, plan, opts.reduction_chunk);
        }
    }
    e.blank();
    e.close("END SUBROUTINE");
}

// ── Declarations ───────────────────────────────────────────────────────────

fn emit_declarations(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    let name = &layout.name;
    e.comment("local variables");
    if layout.optional_bits > 0 {
        e.line("INTEGER(kind=4), VALUE :: optflags");
    }
    for g in &layout.groups {
        let r = g.representative;
        let n = r + 1;
        if layout.args[r].runtime_dim {
            e.line(format!("INTEGER(kind=4), VALUE :: opDat{}Dim", n));
        }
        let read_only = desc
            .args
            .iter()
            .zip(&layout.args)
            .filter(|(_, p)| p.group == Some(g.id))
            .all(|(a, _)| a.access == Access::Read);
        e.line(format!(
            "{}, DEVICE{} :: opDat{}Device{}(*)",
            desc.args[r].data_type.fortran(),
            if read_only { ", INTENT(IN)" } else { "" },
            n,
            name
        ));
    }
    for t in &layout.tables {
        e.line(format!("INTEGER(kind=4), DEVICE, INTENT(IN) :: opMap{}(*)", t.id.ordinal()));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        if !arg.is_direct() {
            continue;
        }
        let n = i + 1;
        if layout.args[i].runtime_dim {
            e.line(format!("INTEGER(kind=4), VALUE :: opDat{}Dim", n));
        }
        e.line(format!(
            "{}, DEVICE{} :: opDat{}Device{}(*)",
            arg.data_type.fortran(),
            if arg.access == Access::Read { ", INTENT(IN)" } else { "" },
            n,
            name
        ));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        if arg.is_global() {
            emit_global_declaration(e, layout, arg, &layout.args[i]);
        }
    }

    if !layout.slots.is_empty() {
        let vars: Vec<String> = layout
            .slots
            .iter()
            .map(|s| format!("map{}idx", s.id.ordinal()))
            .collect();
        e.line(format!("INTEGER(kind=4) :: {}", vars.join(", ")));
    }
    e.blank();

    if layout.is_indirect() {
        e.line("INTEGER(kind=4), DIMENSION(0:*), DEVICE :: pblkMap");
        e.line("INTEGER(kind=4), DIMENSION(0:*), DEVICE :: poffset");
        e.line("INTEGER(kind=4), DIMENSION(0:*), DEVICE :: pnelems");
        e.line("INTEGER(kind=4), DIMENSION(0:*), DEVICE :: pnthrcol");
        e.line("INTEGER(kind=4), DIMENSION(0:*), DEVICE, INTENT(IN) :: pthrcol");
        if layout.reorder {
            e.line("INTEGER(kind=4), DIMENSION(0:*), DEVICE :: pcol_reord");
        }
        e.line("INTEGER(kind=4), VALUE :: blockOffset");
        e.line("INTEGER(kind=4), VALUE :: setSize");
        e.blank();
        e.line("INTEGER(kind=4), SHARED :: numOfColours");
        e.line("INTEGER(kind=4), SHARED :: numberOfActiveThreadsCeiling");
        e.line("INTEGER(kind=4), SHARED :: blockID");
        e.line("INTEGER(kind=4), SHARED :: threadBlockOffset");
        e.line("INTEGER(kind=4), SHARED :: numberOfActiveThreads");
        if layout.is_colored() {
            e.line("INTEGER(kind=4) :: colour1");
            e.line("INTEGER(kind=4) :: colour2");
        }
        e.line("INTEGER(kind=4) :: i3");
    } else {
        e.line("INTEGER(kind=4), VALUE :: setSize");
    }
    e.line("INTEGER(kind=4) :: i1");
    e.line("INTEGER(kind=4) :: i2");
    if layout.unknown_reduction_scratch {
        e.line("INTEGER(kind=4) :: thrIdx");
    }

    for (i, arg) in desc.args.iter().enumerate() {
        let plan = &layout.args[i];
        let n = i + 1;
        let ty = arg.data_type.fortran();
        match plan.realisation {
            Realisation::Accumulator | Realisation::Deferred => {
                if arg.dim.is_scalar() {
                    e.line(format!("{} :: opDat{}Local", ty, n));
                } else {
                    e.line(format!(
                        "{}, DIMENSION(0:{}-1) :: opDat{}Local",
                        ty, plan.kernel_dim, n
                    ));
                }
            }
            Realisation::Staged => {
                e.line(format!("{}, DIMENSION({}) :: opDat{}Staged", ty, plan.kernel_dim, n));
            }
            Realisation::Direct
            | Realisation::Indirect
            | Realisation::StrideRewrite
            | Realisation::Global => {}
        }
    }
}

fn emit_global_declaration(e: &mut Emitter, layout: &LoopLayout, arg: &ArgumentDescriptor, plan: &ArgPlan) {
    let n = plan.index + 1;
    let ty = arg.data_type.fortran();
    if plan.runtime_dim {
        e.line(format!("INTEGER(kind=4), VALUE :: opDat{}Dim", n));
    }
    if arg.reduction_op().is_some() {
        e.line(format!("{}, DIMENSION(:), DEVICE :: reductionArrayDevice{}", ty, n));
        if plan.runtime_dim {
            e.line(format!("{}, DEVICE :: scratchDevice{}(*)", ty, n));
        } else if arg.dim.is_scalar() {
            e.line(format!("{} :: opGblDat{}Device{}", ty, n, layout.name));
        } else {
            e.line(format!(
                "{}, DIMENSION(0:{}-1) :: opGblDat{}Device{}",
                ty, plan.kernel_dim, n, layout.name
            ));
        }
    } else if arg.access == Access::Read && arg.dim.is_scalar() {
        e.line(format!("{}, VALUE :: opGblDat{}Device{}", ty, n, layout.name));
    }
    // Vector READ and all WRITE globals live in module-level device arrays.
}

// ── Element addressing ─────────────────────────────────────────────────────

/// Element index expression for direct arguments.
fn element(layout: &LoopLayout) -> &'static str {
    if layout.is_indirect() {
        "i3 + threadBlockOffset"
    } else {
        "i1"
    }
}

/// Base index (0-based) of argument `i` for the current element: the cached
/// map address for indirect arguments, the element itself otherwise.
fn base_index(layout: &LoopLayout, i: usize) -> String {
    match layout.slot_var(i) {
        Some(v) => v,
        None => format!("({})", element(layout)),
    }
}

/// 1-based address of component `comp` of argument `i`: row-major or
/// stride-addressed depending on the argument's storage.
fn component(layout: &LoopLayout, i: usize, comp: &str) -> String {
    let plan = &layout.args[i];
    let base = base_index(layout, i);
    match &plan.stride {
        Some(stride) => format!("1 + {} * {} + {}", comp, stride, base),
        None => format!("1 + {} + {} * ({})", comp, base, plan.kernel_dim),
    }
}

fn scalar_address(layout: &LoopLayout, i: usize) -> String {
    let plan = &layout.args[i];
    let base = base_index(layout, i);
    match &plan.stride {
        Some(_) => format!("1 + {}", base),
        None => format!("1 + {} * ({})", base, plan.kernel_dim),
    }
}

/// Actual argument passed to the per-element body for argument `i`.
fn call_actual(desc: &KernelDescriptor, layout: &LoopLayout, i: usize) -> String {
    let arg = &desc.args[i];
    let plan = &layout.args[i];
    let n = i + 1;
    let dat = layout.data_name(i);
    let d = &plan.kernel_dim;
    match plan.realisation {
        Realisation::Direct | Realisation::Indirect => {
            let base = base_index(layout, i);
            if arg.dim.is_scalar() {
                format!("{}(1 + {})", dat, base)
            } else {
                format!("{dat}(1 + {b} * ({d}):{b} * ({d}) + ({d}))", dat = dat, b = base, d = d)
            }
        }
        Realisation::StrideRewrite => format!("{}(1 + {})", dat, base_index(layout, i)),
        Realisation::Staged => format!("opDat{}Staged", n),
        Realisation::Accumulator | Realisation::Deferred => format!("opDat{}Local", n),
        Realisation::Global => {
            if arg.reduction_op().is_some() {
                reduction::thread_value(layout, plan)
            } else if arg.access == Access::Write && arg.dim.is_scalar() {
                format!("opGblDat{}Device{}(1)", n, layout.name)
            } else {
                format!("opGblDat{}Device{}", n, layout.name)
            }
        }
    }
}

fn emit_call(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    let actuals: Vec<String> = (0..desc.args.len()).map(|i| call_actual(desc, layout, i)).collect();
    e.comment("kernel call");
    e.continued(format!("CALL {}(", body_name(desc)), &actuals, ")");
}

/// Run `f` under the argument's optional gate, if any.
fn gated(e: &mut Emitter, plan: &ArgPlan, f: impl FnOnce(&mut Emitter)) {
    match plan.opt_bit {
        Some(bit) => {
            e.if_then(format!("BTEST(optflags,{})", bit));
            f(e);
            e.end_if();
        }
        None => f(e),
    }
}

fn emit_staged_loads(e: &mut Emitter, layout: &LoopLayout) {
    for (i, plan) in layout.args.iter().enumerate() {
        if plan.realisation != Realisation::Staged {
            continue;
        }
        let dat = layout.data_name(i);
        let addr = component(layout, i, "i2");
        gated(e, plan, |e| {
            e.do_range("i2", "0", &plan.kernel_dim);
            e.assign(format!("opDat{}Staged(i2 + 1)", i + 1), format!("{}({})", dat, addr));
            e.end_do();
        });
    }
}

fn emit_staged_stores(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    for (i, plan) in layout.args.iter().enumerate() {
        if plan.realisation != Realisation::Staged || desc.args[i].access == Access::Read {
            continue;
        }
        let dat = layout.data_name(i);
        let addr = component(layout, i, "i2");
        gated(e, plan, |e| {
            e.do_range("i2", "0", &plan.kernel_dim);
            e.assign(format!("{}({})", dat, addr), format!("opDat{}Staged(i2 + 1)", i + 1));
            e.end_do();
        });
    }
}

// ── Direct loops ───────────────────────────────────────────────────────────

fn emit_direct_loop(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    e.open("DO i1 = threadIdx%x - 1 + (blockIdx%x - 1) * blockDim%x, setSize - 1, blockDim%x * gridDim%x");
    emit_staged_loads(e, layout);
    emit_call(e, desc, layout);
    emit_staged_stores(e, desc, layout);
    e.end_do();
}

// ── Indirect loops ─────────────────────────────────────────────────────────

fn emit_indirect_loop(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    e.if_then("threadIdx%x - 1 .EQ. 0");
    e.line("blockID = pblkMap(blockIdx%x - 1 + blockOffset)");
    e.line("numberOfActiveThreads = pnelems(blockID)");
    e.line("numberOfActiveThreadsCeiling = blockDim%x * (1 + (numberOfActiveThreads - 1) / blockDim%x)");
    e.line("numOfColours = pnthrcol(blockID)");
    e.line("threadBlockOffset = poffset(blockID)");
    e.end_if();
    e.blank();
    e.line("CALL syncthreads()");
    e.blank();
    e.line("i1 = threadIdx%x - 1");
    e.blank();

    // Every thread runs the same number of rounds, so barriers inside are
    // reached by the whole block.
    e.do_while("i1 < numberOfActiveThreadsCeiling");
    if layout.is_colored() {
        e.line("colour2 = -1");
    }
    e.if_then("i1 < numberOfActiveThreads");
    if layout.reorder {
        e.line("i3 = pcol_reord(i1 + threadBlockOffset)");
    } else {
        e.line("i3 = i1");
    }
    emit_map_addresses(e, layout);
    for (i, arg) in desc.args.iter().enumerate() {
        if layout.args[i].realisation == Realisation::Accumulator {
            e.line(format!("opDat{}Local = {}", i + 1, arg.data_type.zero()));
        }
    }
    emit_staged_loads(e, layout);
    if layout.is_colored() {
        e.line("colour2 = pthrcol(i1 + threadBlockOffset)");
    } else {
        e.blank();
        emit_call(e, desc, layout);
        emit_staged_stores(e, desc, layout);
    }
    e.end_if();

    if layout.is_colored() {
        e.blank();
        e.do_range("colour1", "0", "numOfColours");
        e.if_then("colour2 .EQ. colour1");
        emit_gathers(e, desc, layout);
        emit_call(e, desc, layout);
        emit_staged_stores(e, desc, layout);
        e.end_if();
        e.line("CALL syncthreads()");
        e.if_then("colour2 .EQ. colour1");
        emit_scatters(e, desc, layout);
        e.end_if();
        e.line("CALL syncthreads()");
        e.end_do();
    }
    e.blank();
    e.line("i1 = i1 + blockDim%x");
    e.end_do();
}

/// One address per map slot, shared by every argument using that
/// (map, column) pair.
fn emit_map_addresses(e: &mut Emitter, layout: &LoopLayout) {
    for slot in &layout.slots {
        let table = layout.table(slot.table);
        let assign = format!(
            "map{}idx = opMap{}(1 + i3 + threadBlockOffset + setSize * {})",
            slot.id.ordinal(),
            table.id.ordinal(),
            slot.column
        );
        if slot.gate.is_empty() {
            e.line(assign);
            continue;
        }
        let cond: Vec<String> = slot
            .gate
            .iter()
            .map(|b| format!("BTEST(optflags,{})", b))
            .collect();
        e.line(format!("map{}idx = 0", slot.id.ordinal()));
        e.if_then(cond.join(" .OR. "));
        e.line(assign);
        e.end_if();
    }
}

/// Per-thread copies of `RW` indirect arguments, taken inside the colour.
fn emit_gathers(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    for (i, arg) in desc.args.iter().enumerate() {
        let plan = &layout.args[i];
        if plan.realisation != Realisation::Deferred {
            continue;
        }
        let dat = layout.data_name(i);
        gated(e, plan, |e| {
            if arg.dim.is_scalar() {
                e.assign(format!("opDat{}Local", i + 1), format!("{}({})", dat, scalar_address(layout, i)));
            } else {
                e.do_range("i2", "0", &plan.kernel_dim);
                e.assign(
                    format!("opDat{}Local(i2)", i + 1),
                    format!("{}({})", dat, component(layout, i, "i2")),
                );
                e.end_do();
            }
        });
    }
}

/// `INC` accumulation and `RW` write-back, between the colour's barriers.
fn emit_scatters(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    for (i, arg) in desc.args.iter().enumerate() {
        let plan = &layout.args[i];
        let inc = match plan.realisation {
            Realisation::Accumulator => true,
            Realisation::Deferred => false,
            _ => continue,
        };
        let dat = layout.data_name(i);
        let n = i + 1;
        gated(e, plan, |e| {
            if arg.dim.is_scalar() {
                let at = format!("{}({})", dat, scalar_address(layout, i));
                if inc {
                    e.assign(&at, format!("{} + opDat{}Local", at, n));
                } else {
                    e.assign(&at, format!("opDat{}Local", n));
                }
            } else {
                e.do_range("i2", "0", &plan.kernel_dim);
                let at = format!("{}({})", dat, component(layout, i, "i2"));
                if inc {
                    e.assign(&at, format!("{} + opDat{}Local(i2)", at, n));
                } else {
                    e.assign(&at, format!("opDat{}Local(i2)", n));
                }
                e.end_do();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ArgKind, DataType, MapRef};
    use crate::dim::Dim;
    use crate::emit::MAX_LINE;
    use crate::layout::plan;

    fn arg(dataset: &str, kind: ArgKind, access: Access, dim: u32) -> ArgumentDescriptor {
        ArgumentDescriptor {
            dataset: dataset.into(),
            kind,
            access,
            data_type: DataType::Real8,
            dim: Dim::Fixed(dim),
            structure_of_arrays: false,
            optional: false,
        }
    }

    fn via(map: &str, column: u32) -> ArgKind {
        ArgKind::Indirect(MapRef {
            map: map.into(),
            column,
        })
    }

    fn render(desc: &KernelDescriptor, calls_routines: bool) -> String {
        let opts = GenOptions::default();
        let layout = plan(desc, &opts, calls_routines).unwrap();
        let mut e = Emitter::new();
        emit_kernel(&mut e, desc, &layout, &opts);
        e.finish()
    }

    fn res_calc() -> KernelDescriptor {
        KernelDescriptor {
            name: "res_calc".into(),
            set: "edges".into(),
            args: vec![
                arg("x", via("pedge", 0), Access::Read, 2),
                arg("x", via("pedge", 1), Access::Read, 2),
                arg("res", via("pecell", 0), Access::Inc, 4),
                arg("res", via("pecell", 1), Access::Inc, 4),
            ],
            reorder: false,
        }
    }

    #[test]
    fn direct_loop_has_no_barrier() {
        let k = KernelDescriptor {
            name: "save_soln".into(),
            set: "cells".into(),
            args: vec![
                arg("q", ArgKind::Direct, Access::Read, 4),
                arg("qold", ArgKind::Direct, Access::Write, 4),
            ],
            reorder: false,
        };
        let text = render(&k, false);
        assert!(!text.contains("syncthreads"));
        assert!(text.contains("setSize - 1, blockDim%x * gridDim%x"));
        assert!(text.contains("opDat1Devicesave_soln(1 + (i1) * (4):(i1) * (4) + (4))"));
        assert!(text.contains("REAL(kind=8), DEVICE, INTENT(IN) :: opDat1Devicesave_soln(*)"));
    }

    #[test]
    fn map_addresses_shared_across_groups() {
        let text = render(&res_calc(), false);
        assert_eq!(text.matches("map1idx = opMap1(").count(), 1);
        assert!(text.contains("map3idx = opMap2(1 + i3 + threadBlockOffset + setSize * 0)"));
        assert!(text.contains("opDat1Deviceres_calc(1 + map2idx * (2):map2idx * (2) + (2))"));
    }

    #[test]
    fn scatter_between_colour_barriers() {
        let text = render(&res_calc(), false);
        let colour_loop = text.find("DO colour1 = 0, numOfColours - 1, 1").unwrap();
        let call = text.find("CALL res_calc_gpu(").unwrap();
        let scatter = text
            .find("opDat3Deviceres_calc(1 + i2 + map3idx * (4)) = opDat3Deviceres_calc(1 + i2 + map3idx * (4)) + opDat3Local(i2)")
            .unwrap();
        let barriers: Vec<usize> = text.match_indices("CALL syncthreads()").map(|(p, _)| p).collect();
        assert_eq!(barriers.len(), 3);
        assert!(colour_loop < call);
        assert!(barriers[1] > call && barriers[1] < scatter);
        assert!(barriers[2] > scatter);
        assert!(text.contains("opDat3Local = 0.0_8"));
    }

    #[test]
    fn read_only_indirect_skips_colours() {
        let k = KernelDescriptor {
            name: "adt_calc".into(),
            set: "cells".into(),
            args: vec![
                arg("x", via("pcell", 0), Access::Read, 2),
                arg("adt", ArgKind::Direct, Access::Write, 1),
            ],
            reorder: true,
        };
        let text = render(&k, false);
        assert!(!text.contains("colour1"));
        assert!(text.contains("i3 = pcol_reord(i1 + threadBlockOffset)"));
        assert!(text.contains("opDat2Deviceadt_calc(1 + (i3 + threadBlockOffset))"));
        assert_eq!(text.matches("CALL syncthreads()").count(), 1);
    }

    #[test]
    fn rw_indirect_gathers_inside_colour() {
        let k = KernelDescriptor {
            name: "smooth".into(),
            set: "edges".into(),
            args: vec![arg("u", via("pedge", 0), Access::Rw, 1)],
            reorder: false,
        };
        let text = render(&k, false);
        let gather = text.find("opDat1Local = opDat1Devicesmooth(1 + map1idx * (1))").unwrap();
        let colour_loop = text.find("DO colour1").unwrap();
        let write = text.find("opDat1Devicesmooth(1 + map1idx * (1)) = opDat1Local").unwrap();
        assert!(colour_loop < gather && gather < write);
    }

    #[test]
    fn staged_soa_argument() {
        let mut q = arg("q", ArgKind::Direct, Access::Rw, 4);
        q.structure_of_arrays = true;
        let k = KernelDescriptor {
            name: "update".into(),
            set: "cells".into(),
            args: vec![q],
            reorder: false,
        };
        let text = render(&k, true);
        assert!(text.contains("REAL(kind=8), DIMENSION(4) :: opDat1Staged"));
        assert!(text.contains(
            "opDat1Staged(i2 + 1) = opDat1Deviceupdate(1 + i2 * direct_stride_OP2CONSTANT + (i1))"
        ));
        assert!(text.contains(
            "opDat1Deviceupdate(1 + i2 * direct_stride_OP2CONSTANT + (i1)) = opDat1Staged(i2 + 1)"
        ));
        let rewritten = render(&k, false);
        assert!(rewritten.contains("& opDat1Deviceupdate(1 + (i1)))"));
    }

    #[test]
    fn soa_scatter_and_gather_lines_fit_free_form() {
        let mut k = res_calc();
        k.args[2].structure_of_arrays = true;
        k.args[3].structure_of_arrays = true;
        let mut u = arg("u", via("pecell", 0), Access::Rw, 4);
        u.structure_of_arrays = true;
        k.args.push(u);
        let text = render(&k, false);

        let long: Vec<&str> = text.lines().filter(|l| l.len() > MAX_LINE).collect();
        assert!(long.is_empty(), "{:#?}", long);
        let at = "opDat3Deviceres_calc(1 + i2 * opMap2_stride_OP2CONSTANT + map3idx)";
        assert!(text.contains(&format!("{} = &\n", at)));
        assert!(text.contains(&format!("& {} + &\n", at)));
        assert!(text.contains("& opDat3Local(i2)\n"));
        assert!(text.contains("opDat5Local(i2) = opDat5Deviceres_calc(1 + i2 * opMap2_stride_OP2CONSTANT + map3idx)"));
    }

    #[test]
    fn optional_rw_gates_gather_and_write_back() {
        let mut a = arg("u", via("m", 0), Access::Rw, 1);
        a.optional = true;
        let k = KernelDescriptor {
            name: "opt_rw".into(),
            set: "edges".into(),
            args: vec![a],
            reorder: false,
        };
        let text = render(&k, false);
        let gate = "IF (BTEST(optflags,0)) THEN";
        let gate_before = |p: usize| text[..p].rfind(gate).unwrap();
        let colour = text.find("IF (colour2 .EQ. colour1) THEN").unwrap();
        let gather = text.find("opDat1Local = opDat1Deviceopt_rw(1 + map1idx * (1))").unwrap();
        let write = text.find("opDat1Deviceopt_rw(1 + map1idx * (1)) = opDat1Local").unwrap();
        let barrier = text[..write].rfind("CALL syncthreads()").unwrap();

        assert!(gate_before(gather) > colour);
        assert!(gate_before(write) > barrier);
        // Map address, gather and write-back.
        assert_eq!(text.matches(gate).count(), 3);
    }

    #[test]
    fn optional_arguments_are_gated() {
        let mut a = arg("x", via("m", 0), Access::Inc, 1);
        a.optional = true;
        let k = KernelDescriptor {
            name: "opt".into(),
            set: "edges".into(),
            args: vec![a],
            reorder: false,
        };
        let text = render(&k, false);
        assert!(text.contains("INTEGER(kind=4), VALUE :: optflags"));
        assert!(text.contains("IF (BTEST(optflags,0)) THEN"));
        assert_eq!(launch_args(&k, &plan(&k, &GenOptions::default(), false).unwrap())[0].formal, "optflags");
    }
}
