// reduction.rs — Block-level and host-side reductions for global arguments
//
// Device side: one scalar and one vector routine per reduced data type,
// each a shared-memory tree reduction parameterized by a runtime operator
// code. Thread 0 of every block folds the block's result into that block's
// slot of a global result array.
//
// Host side: slots are seeded before launch (`INC` at zero, `MIN`/`MAX` at
// the caller's value) and, after the device has completed, folded
// sequentially into the caller's value with the same operator.
//
// Preconditions: power-of-two threads per block; dynamic shared memory of
//                at least `reductionSize * threadsPerBlock` bytes.
// Postconditions: a launch that touches no elements leaves every reduced
//                 variable unchanged.
// Failure modes: none (types are checked by descriptor validation).
// Side effects: none.

use crate::descriptor::{ArgumentDescriptor, ReductionOp};
use crate::emit::Emitter;
use crate::layout::{ArgPlan, LoopLayout, ReductionRoutine};

impl ReductionOp {
    /// Fortran expression folding `x` into `acc`.
    pub fn fortran(self, acc: &str, x: &str) -> String {
        match self {
            ReductionOp::Sum => format!("{} + {}", acc, x),
            ReductionOp::Min => format!("MIN({}, {})", acc, x),
            ReductionOp::Max => format!("MAX({}, {})", acc, x),
        }
    }
}

// ── Device routines ────────────────────────────────────────────────────────

pub fn emit_routines(e: &mut Emitter, layout: &LoopLayout) {
    for routine in &layout.reductions {
        if routine.vector {
            emit_vector(e, routine);
        } else {
            emit_scalar(e, routine);
        }
        e.blank();
    }
}

fn shared_name(routine: &ReductionRoutine) -> String {
    format!("shared{}", routine.data_type.reduction_suffix().unwrap_or("Float8"))
}

fn emit_scalar(e: &mut Emitter, routine: &ReductionRoutine) {
    let ty = routine.data_type.fortran();
    let sh = shared_name(routine);
    e.open(format!(
        "attributes (device) SUBROUTINE {}(reductionResult,inputValue,reductionOperation)",
        routine.name()
    ));
    e.line(format!("{}, DIMENSION(:), DEVICE :: reductionResult", ty));
    e.line(format!("{} :: inputValue", ty));
    e.line("INTEGER(kind=4), VALUE :: reductionOperation");
    e.line(format!("{}, DIMENSION(0:*), SHARED :: {}", ty, sh));
    e.line("INTEGER(kind=4) :: i1");
    e.line("INTEGER(kind=4) :: threadID");
    e.line("threadID = threadIdx%x - 1");
    e.line("i1 = ishft(blockDim%x,-1)");
    e.line("CALL syncthreads()");
    e.line(format!("{}(threadID) = inputValue", sh));
    e.blank();
    e.do_while("i1 > 0");
    e.line("CALL syncthreads()");
    e.if_then("threadID < i1");
    operator_cases(e, |e, op| {
        let own = format!("{}(threadID)", sh);
        let other = format!("{}(threadID + i1)", sh);
        e.line(format!("{} = {}", own, op.fortran(&own, &other)));
    });
    e.end_if();
    e.line("i1 = ishft(i1,-1)");
    e.end_do();
    e.blank();
    e.line("CALL syncthreads()");
    e.if_then("threadID .EQ. 0");
    operator_cases(e, |e, op| {
        let slot = "reductionResult(1)";
        e.line(format!("{} = {}", slot, op.fortran(slot, &format!("{}(0)", sh))));
    });
    e.end_if();
    e.line("CALL syncthreads()");
    e.close("END SUBROUTINE");
}

fn emit_vector(e: &mut Emitter, routine: &ReductionRoutine) {
    let ty = routine.data_type.fortran();
    let sh = shared_name(routine);
    e.open(format!(
        "attributes (device) SUBROUTINE {}(reductionResult,inputValue,reductionOperation,dim)",
        routine.name()
    ));
    e.line(format!("{}, DIMENSION(:), DEVICE :: reductionResult", ty));
    e.line(format!("{}, DIMENSION(:) :: inputValue", ty));
    e.line("INTEGER(kind=4), VALUE :: reductionOperation");
    e.line("INTEGER(kind=4), VALUE :: dim");
    e.line(format!("{}, DIMENSION(0:*), SHARED :: {}", ty, sh));
    e.line("INTEGER(kind=4) :: i1");
    e.line("INTEGER(kind=4) :: i2");
    e.line("INTEGER(kind=4) :: threadID");
    e.line("threadID = threadIdx%x - 1");
    e.line("i1 = ishft(blockDim%x,-1)");
    e.line("CALL syncthreads()");
    e.line(format!("{}(threadID*dim:threadID*dim+dim-1) = inputValue(1:dim)", sh));
    e.blank();
    e.do_while("i1 > 0");
    e.line("CALL syncthreads()");
    e.if_then("threadID < i1");
    operator_cases(e, |e, op| {
        e.do_range("i2", "0", "dim");
        let own = format!("{}(threadID*dim + i2)", sh);
        let other = format!("{}((threadID + i1)*dim + i2)", sh);
        e.line(format!("{} = {}", own, op.fortran(&own, &other)));
        e.end_do();
    });
    e.end_if();
    e.line("i1 = ishft(i1,-1)");
    e.end_do();
    e.blank();
    e.line("CALL syncthreads()");
    e.if_then("threadID .EQ. 0");
    operator_cases(e, |e, op| {
        e.do_range("i2", "0", "dim");
        let slot = "reductionResult(1+i2)";
        e.line(format!("{} = {}", slot, op.fortran(slot, &format!("{}(i2)", sh))));
        e.end_do();
    });
    e.end_if();
    e.line("CALL syncthreads()");
    e.close("END SUBROUTINE");
}

/// `SELECT CASE` over the runtime operator code.
fn operator_cases(e: &mut Emitter, mut body: impl FnMut(&mut Emitter, ReductionOp)) {
    e.line("SELECT CASE(reductionOperation)");
    for op in [ReductionOp::Sum, ReductionOp::Min, ReductionOp::Max] {
        e.open(format!("CASE ({})", op.code()));
        body(e, op);
        e.dedent();
    }
    e.line("END SELECT");
}

// ── Kernel-side naming ─────────────────────────────────────────────────────

/// Per-block slot index of the current block, 0-based.
pub fn block_slot(layout: &LoopLayout) -> &'static str {
    if layout.is_indirect() {
        "blockIdx%x - 1 + blockOffset"
    } else {
        "blockIdx%x - 1"
    }
}

/// Per-thread contributions of a reduction argument, as passed to the body.
pub fn thread_value(layout: &LoopLayout, plan: &ArgPlan) -> String {
    let n = plan.index + 1;
    if plan.runtime_dim {
        format!(
            "scratchDevice{n}(thrIdx*({d})+1:(thrIdx+1)*({d}))",
            n = n,
            d = plan.kernel_dim
        )
    } else {
        format!("opGblDat{}Device{}", n, layout.name)
    }
}

/// Initialize per-thread contributions before the element loop.
pub fn emit_thread_init(e: &mut Emitter, layout: &LoopLayout, arg: &ArgumentDescriptor, plan: &ArgPlan) {
    let Some(op) = arg.reduction_op() else { return };
    let n = plan.index + 1;
    let target = thread_value(layout, plan);
    let slot = block_slot(layout);
    match op {
        ReductionOp::Sum => e.line(format!("{} = {}", target, arg.data_type.zero())),
        ReductionOp::Min | ReductionOp::Max => {
            if arg.dim.is_scalar() {
                e.line(format!("{} = reductionArrayDevice{}({} + 1)", target, n, slot));
            } else {
                e.line(format!(
                    "{t} = reductionArrayDevice{n}(({s})*({d}) + 1:({s})*({d}) + ({d}))",
                    t = target,
                    n = n,
                    s = slot,
                    d = plan.kernel_dim
                ));
            }
        }
    }
}

/// Combine the block's contributions into its slot, after the element loop.
pub fn emit_block_reduce(
    e: &mut Emitter,
    layout: &LoopLayout,
    arg: &ArgumentDescriptor,
    plan: &ArgPlan,
    chunk: u32,
) {
    let Some(op) = arg.reduction_op() else { return };
    let routine = ReductionRoutine {
        data_type: arg.data_type,
        vector: !arg.dim.is_scalar(),
    };
    let n = plan.index + 1;
    let slot = block_slot(layout);
    if !routine.vector {
        e.line(format!(
            "CALL {}(reductionArrayDevice{}({} + 1:),{},{})",
            routine.name(),
            n,
            slot,
            thread_value(layout, plan),
            op.code()
        ));
        return;
    }
    let d = &plan.kernel_dim;
    // Bounded chunks cap the shared memory one call needs.
    e.do_step("i1", "0", d, chunk.to_string());
    e.line(format!("i2 = MIN(i1 + {}, {})", chunk, d));
    let source = if plan.runtime_dim {
        format!("scratchDevice{n}(thrIdx*({d})+1+i1:(thrIdx+1)*({d}))", n = n, d = d)
    } else {
        format!("opGblDat{}Device{}(i1:)", n, layout.name)
    };
    e.line(format!(
        "CALL {}(reductionArrayDevice{n}(({s})*({d}) + 1 + i1:),{src},{op},i2 - i1)",
        routine.name(),
        n = n,
        s = slot,
        d = d,
        src = source,
        op = op.code()
    ));
    e.end_do();
}

// ── Host side ──────────────────────────────────────────────────────────────

/// Extent of argument `plan`'s slot group, as host text.
fn host_span(plan: &ArgPlan, base: &str) -> String {
    format!(
        "{b} * ({d}) + 1 : {b} * ({d}) + ({d})",
        b = base,
        d = plan.host_dim
    )
}

pub fn emit_host_declarations(e: &mut Emitter, arg: &ArgumentDescriptor, plan: &ArgPlan) {
    if arg.reduction_op().is_none() {
        return;
    }
    let n = plan.index + 1;
    let ty = arg.data_type.fortran();
    e.line(format!("{}, DIMENSION(:), ALLOCATABLE :: reductionArrayHost{}", ty, n));
    e.line(format!("INTEGER(kind=4) :: reductionCardinality{}", n));
    if plan.runtime_dim {
        e.line(format!("{}, DIMENSION(:), DEVICE, POINTER :: scratchDevice{}", ty, n));
        e.line(format!("INTEGER(kind=4) :: scratchDevice{}Size", n));
    }
}

/// Size, allocate and seed the per-block slots; `blocksPerGrid` holds the
/// true block count.
pub fn emit_host_setup(e: &mut Emitter, layout: &LoopLayout, arg: &ArgumentDescriptor, plan: &ArgPlan) {
    let Some(op) = arg.reduction_op() else { return };
    let n = plan.index + 1;
    let dev = format!("reductionArrayDevice{}{}", n, layout.name);
    let total = format!("reductionCardinality{} * ({})", n, plan.host_dim);
    e.line(format!("reductionCardinality{} = blocksPerGrid * 1", n));
    e.line(format!("allocate( reductionArrayHost{}({}) )", n, total));
    e.if_then(format!("allocated({})", dev));
    e.if_then(format!("size({}) .LT. {}", dev, total));
    e.line(format!("deallocate( {} )", dev));
    e.end_if();
    e.end_if();
    e.if_then(format!(".not. allocated({})", dev));
    e.line(format!("allocate( {}({}) )", dev, total));
    e.end_if();
    e.blank();
    let seed = match op {
        ReductionOp::Sum => arg.data_type.zero().to_string(),
        ReductionOp::Min | ReductionOp::Max if arg.dim.is_scalar() => format!("opDat{}Host", n),
        ReductionOp::Min | ReductionOp::Max => format!("opDat{}Host(1:{})", n, plan.host_dim),
    };
    e.do_range("i10", "0", format!("reductionCardinality{}", n));
    if arg.dim.is_scalar() {
        e.line(format!("reductionArrayHost{}(i10 + 1) = {}", n, seed));
    } else {
        e.line(format!("reductionArrayHost{}({}) = {}", n, host_span(plan, "i10"), seed));
    }
    e.end_do();
    e.blank();
    e.line(format!("{}(1:{}) = reductionArrayHost{}(1:{})", dev, total, n, total));
}

/// Fold all slots into the caller's value. Emitted only after the device
/// has completed.
pub fn emit_host_combine(e: &mut Emitter, layout: &LoopLayout, arg: &ArgumentDescriptor, plan: &ArgPlan) {
    let Some(op) = arg.reduction_op() else { return };
    let n = plan.index + 1;
    let total = format!("reductionCardinality{} * ({})", n, plan.host_dim);
    e.line(format!(
        "reductionArrayHost{n}(1:{t}) = reductionArrayDevice{n}{name}(1:{t})",
        n = n,
        t = total,
        name = layout.name
    ));
    e.blank();
    e.do_range("i10", "0", format!("reductionCardinality{}", n));
    if arg.dim.is_scalar() {
        let host = format!("opDat{}Host", n);
        let part = format!("reductionArrayHost{}(i10 + 1)", n);
        e.line(format!("{} = {}", host, op.fortran(&host, &part)));
    } else {
        let host = format!("opDat{}Host(1:{})", n, plan.host_dim);
        let part = format!("reductionArrayHost{}({})", n, host_span(plan, "i10"));
        e.line(format!("{} = {}", host, op.fortran(&host, &part)));
    }
    e.end_do();
    e.blank();
    e.line(format!("deallocate( reductionArrayHost{} )", n));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenOptions;
    use crate::descriptor::{Access, ArgKind, DataType, KernelDescriptor};
    use crate::dim::Dim;
    use crate::layout::plan;

    fn global(access: Access, dim: Dim) -> ArgumentDescriptor {
        ArgumentDescriptor {
            dataset: "g".into(),
            kind: ArgKind::Global,
            access,
            data_type: DataType::Real8,
            dim,
            structure_of_arrays: false,
            optional: false,
        }
    }

    fn direct() -> ArgumentDescriptor {
        ArgumentDescriptor {
            dataset: "q".into(),
            kind: ArgKind::Direct,
            access: Access::Read,
            data_type: DataType::Real8,
            dim: Dim::Fixed(1),
            structure_of_arrays: false,
            optional: false,
        }
    }

    fn layout_for(args: Vec<ArgumentDescriptor>) -> (KernelDescriptor, LoopLayout) {
        let k = KernelDescriptor {
            name: "update".into(),
            set: "cells".into(),
            args,
            reorder: false,
        };
        let l = plan(&k, &GenOptions::default(), false).unwrap();
        (k, l)
    }

    fn host_text(access: Access, dim: Dim) -> String {
        let (k, l) = layout_for(vec![direct(), global(access, dim)]);
        let mut e = Emitter::new();
        emit_host_setup(&mut e, &l, &k.args[1], &l.args[1]);
        emit_host_combine(&mut e, &l, &k.args[1], &l.args[1]);
        e.finish()
    }

    #[test]
    fn host_seed_and_fold_per_operator() {
        let cases = [
            (Access::Inc, "0.0_8", "opDat2Host = opDat2Host + reductionArrayHost2(i10 + 1)"),
            (Access::Min, "opDat2Host", "opDat2Host = MIN(opDat2Host, reductionArrayHost2(i10 + 1))"),
            (Access::Max, "opDat2Host", "opDat2Host = MAX(opDat2Host, reductionArrayHost2(i10 + 1))"),
        ];
        for (access, seed, fold) in cases {
            let text = host_text(access, Dim::Fixed(1));
            let seeded = format!("reductionArrayHost2(i10 + 1) = {}\n", seed);
            assert!(text.contains(&seeded), "{:?}: {}", access, text);
            assert!(text.contains(fold), "{:?}: {}", access, text);
        }
    }

    #[test]
    fn vector_host_seed_and_fold_per_operator() {
        let slots = "reductionArrayHost2(i10 * (3) + 1 : i10 * (3) + (3))";
        let cases = [
            (Access::Inc, "0.0_8".to_string(), format!("opDat2Host(1:3) = opDat2Host(1:3) + {}", slots)),
            (
                Access::Min,
                "opDat2Host(1:3)".to_string(),
                format!("opDat2Host(1:3) = MIN(opDat2Host(1:3), {})", slots),
            ),
            (
                Access::Max,
                "opDat2Host(1:3)".to_string(),
                format!("opDat2Host(1:3) = MAX(opDat2Host(1:3), {})", slots),
            ),
        ];
        for (access, seed, fold) in cases {
            let text = host_text(access, Dim::Fixed(3));
            let seeded = format!("{} = {}\n", slots, seed);
            assert!(text.contains(&seeded), "{:?}: {}", access, text);
            assert!(text.contains(&fold), "{:?}: {}", access, text);
            // Slots are copied back before the fold reads them.
            let copy_back = text.find("reductionArrayHost2(1:reductionCardinality2 * (3)) = ").unwrap();
            assert!(copy_back < text.find(&fold).unwrap());
        }
    }

    #[test]
    fn scalar_routine_tree_shape() {
        let (_, l) = layout_for(vec![direct(), global(Access::Inc, Dim::Fixed(1))]);
        let mut e = Emitter::new();
        emit_routines(&mut e, &l);
        let text = e.finish();
        assert!(text.contains("SUBROUTINE ReductionFloat8(reductionResult,inputValue,reductionOperation)"));
        assert!(text.contains("i1 = ishft(blockDim%x,-1)"));
        assert!(text.contains("sharedFloat8(threadID) = sharedFloat8(threadID) + sharedFloat8(threadID + i1)"));
        assert!(text.contains("reductionResult(1) = MIN(reductionResult(1), sharedFloat8(0))"));
        assert!(!text.contains("Mdim"));
    }

    #[test]
    fn vector_call_is_chunked() {
        let (k, l) = layout_for(vec![direct(), global(Access::Max, Dim::Fixed(20))]);
        let mut e = Emitter::new();
        emit_block_reduce(&mut e, &l, &k.args[1], &l.args[1], 8);
        let text = e.finish();
        assert!(text.starts_with("DO i1 = 0, 20 - 1, 8\n"));
        assert!(text.contains("i2 = MIN(i1 + 8, 20)"));
        assert!(text.contains(
            "CALL ReductionFloat8Mdim(reductionArrayDevice2((blockIdx%x - 1)*(20) + 1 + i1:),opGblDat2Deviceupdate(i1:),2,i2 - i1)"
        ));
    }

    #[test]
    fn host_seed_and_fold() {
        let (k, l) = layout_for(vec![direct(), global(Access::Min, Dim::Fixed(1))]);
        let mut e = Emitter::new();
        emit_host_setup(&mut e, &l, &k.args[1], &l.args[1]);
        emit_host_combine(&mut e, &l, &k.args[1], &l.args[1]);
        let text = e.finish();
        assert!(text.contains("reductionArrayHost2(i10 + 1) = opDat2Host"));
        assert!(text.contains("opDat2Host = MIN(opDat2Host, reductionArrayHost2(i10 + 1))"));
    }

    #[test]
    fn inc_seeds_zero() {
        let (k, l) = layout_for(vec![direct(), global(Access::Inc, Dim::Fixed(3))]);
        let mut e = Emitter::new();
        emit_host_setup(&mut e, &l, &k.args[1], &l.args[1]);
        let text = e.finish();
        assert!(text.contains("reductionArrayHost2(i10 * (3) + 1 : i10 * (3) + (3)) = 0.0_8"));
    }
}
