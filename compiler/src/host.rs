// host.rs — Host stub synthesizer
//
// Emits `<name>_host`, the routine the application calls in place of the
// sequential loop, plus the module-level state it shares with the kernel
// (stride constants, reduction buffers, global copies, the plan handle).
//
// Order of the stub: flag word, argument array, timing registration,
// stride refresh, halo exchange, plan or grid sizing, device pointers,
// global copies, reduction buffers, scratch, dispatch, halo wait, device
// synchronization, global copy-back and reduction combine, cross-rank
// reduce, dirty bits, instrumentation.
//
// Preconditions: `layout` was planned from `desc`.
// Postconditions: reduction slots are only read back after
//                 `cudaDeviceSynchronize`.
// Failure modes: none.
// Side effects: none.

use crate::config::GenOptions;
use crate::descriptor::{Access, ArgumentDescriptor, KernelDescriptor};
use crate::emit::Emitter;
use crate::kernel;
use crate::layout::{LoopLayout, DIRECT_STRIDE_CONSTANT, DIRECT_STRIDE_HOST};
use crate::reduction;

pub fn host_name(desc: &KernelDescriptor) -> String {
    format!("{}_host", desc.name)
}

/// Globals copied to a module-level device array: vector `READ` and all `WRITE`.
fn has_device_copy(arg: &ArgumentDescriptor) -> bool {
    arg.is_global()
        && (arg.access == Access::Write || (arg.access == Access::Read && !arg.dim.is_scalar()))
}

/// Host view of a global is an array unless it is a scalar that is not written.
fn host_is_array(arg: &ArgumentDescriptor) -> bool {
    arg.access == Access::Write || !arg.dim.is_scalar()
}

// ── Module state ───────────────────────────────────────────────────────────

pub fn emit_module_state(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    e.comment(format!("{} variable declarations", desc.name));
    e.blank();
    for t in layout.tables.iter().filter(|t| t.soa) {
        e.line(format!("INTEGER(kind=4), CONSTANT :: {}", t.stride_constant()));
        e.line(format!("INTEGER(kind=4) :: {}", t.stride_host()));
    }
    if layout.direct_stride_source.is_some() {
        e.line(format!("INTEGER(kind=4), CONSTANT :: {}", DIRECT_STRIDE_CONSTANT));
        e.line(format!("INTEGER(kind=4) :: {}", DIRECT_STRIDE_HOST));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        let ty = arg.data_type.fortran();
        if arg.reduction_op().is_some() {
            e.line(format!(
                "{}, DIMENSION(:), DEVICE, ALLOCATABLE :: reductionArrayDevice{}{}",
                ty,
                i + 1,
                layout.name
            ));
        }
        if has_device_copy(arg) {
            e.line(format!(
                "{}, DIMENSION(:), DEVICE, ALLOCATABLE :: opGblDat{}Device{}",
                ty,
                i + 1,
                layout.name
            ));
        }
    }
    if layout.is_indirect() {
        e.line(format!("TYPE ( c_ptr ) :: planRet_{}", layout.name));
    }
}

// ── Stub ───────────────────────────────────────────────────────────────────

pub fn emit_host(
    e: &mut Emitter,
    desc: &KernelDescriptor,
    layout: &LoopLayout,
    opts: &GenOptions,
    kernel_index: u32,
) {
    let nargs = desc.args.len();
    let op_args: Vec<String> = (1..=nargs).map(|n| format!("opArg{}", n)).collect();
    e.comment("Stub for GPU execution");
    e.continued(
        format!("attributes (host) SUBROUTINE {}( userSubroutine, set,", host_name(desc)),
        &op_args,
        " )",
    );
    e.indent();
    e.blank();
    e.line("IMPLICIT NONE");
    emit_declarations(e, desc, layout);
    e.blank();

    emit_flag_word(e, layout);
    e.line(format!("numberOfOpDats = {}", nargs));
    e.blank();
    for n in 1..=nargs {
        e.line(format!("opArgArray({n}) = opArg{n}", n = n));
    }
    e.blank();
    e.line(format!(
        "returnSetKernelTiming = setKernelTime({} , userSubroutine//C_NULL_CHAR, &",
        kernel_index
    ));
    e.line("& 0.d0, 0.00000_4,0.00000_4, 0)");
    e.blank();
    emit_stride_refresh(e, layout);

    e.line("call op_timers_core(startTime)");
    e.blank();
    e.line("n_upper = op_mpi_halo_exchanges_cuda(set%setCPtr,numberOfOpDats,opArgArray)");
    e.blank();

    if layout.is_indirect() {
        emit_plan_acquisition(e, layout);
    } else {
        let blocks = if layout.unknown_reduction_scratch {
            opts.scratch_blocks
        } else {
            opts.direct_blocks
        };
        e.line(format!("blocksPerGrid = {}", blocks));
        e.line("threadsPerBlock = getBlockSize(userSubroutine//C_NULL_CHAR,set%setPtr%size)");
        e.line("dynamicSharedMemorySize = reductionSize(opArgArray,numberOfOpDats) * threadsPerBlock");
    }
    e.blank();

    emit_device_pointers(e, desc, layout);
    emit_global_copies(e, desc, layout);

    if layout.is_indirect() && !layout.reductions.is_empty() {
        // One slot per block over all colours.
        e.line("blocksPerGrid = 0");
        e.do_range("i2", "0", format!("actualPlan_{}%ncolors", layout.name));
        e.line("blocksPerGrid = blocksPerGrid + ncolblk(i2 + 1)");
        e.end_do();
        e.blank();
    }
    for (arg, plan) in desc.args.iter().zip(&layout.args) {
        if arg.reduction_op().is_some() {
            reduction::emit_host_setup(e, layout, arg, plan);
            e.blank();
        }
    }
    if layout.unknown_reduction_scratch {
        emit_scratch(e, desc, layout);
    }

    emit_dispatch(e, desc, layout);

    e.if_then("(n_upper .EQ. 0) .OR. (n_upper .EQ. set%setPtr%core_size)");
    e.line("CALL op_mpi_wait_all_cuda(numberOfOpDats,opArgArray)");
    e.end_if();
    e.blank();
    e.line("istat = cudaDeviceSynchronize()");
    e.blank();

    emit_results(e, desc, layout);

    e.line("CALL op_mpi_set_dirtybit_cuda(numberOfOpDats,opArgArray)");
    e.blank();
    e.line("call op_timers_core(endTime)");
    e.blank();
    emit_instrumentation(e, desc, layout, kernel_index);
    e.line("calledTimes = calledTimes + 1");
    e.close("END SUBROUTINE");
}

fn emit_declarations(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    let name = &layout.name;
    let nargs = desc.args.len();
    e.line(format!("character(len={}), INTENT(IN) :: userSubroutine", name.len()));
    e.line("TYPE ( op_set ) , INTENT(IN) :: set");
    e.blank();
    for n in 1..=nargs {
        e.line(format!("TYPE ( op_arg ) , INTENT(IN) :: opArg{}", n));
    }
    e.blank();
    e.line(format!("TYPE ( op_arg ) , DIMENSION({}) :: opArgArray", nargs));
    e.line("INTEGER(kind=4) :: numberOfOpDats");
    e.line("INTEGER(kind=4) :: n_upper");
    e.line("REAL(kind=8) :: startTime");
    e.line("REAL(kind=8) :: endTime");
    e.line("INTEGER(kind=4) :: returnSetKernelTiming");
    e.blank();

    for g in &layout.groups {
        let r = g.representative;
        e.line(format!(
            "{}, DIMENSION(:), DEVICE, POINTER :: opDat{}Device{}",
            desc.args[r].data_type.fortran(),
            r + 1,
            name
        ));
        e.line(format!("INTEGER(kind=4) :: opDat{}Cardinality", r + 1));
    }
    for t in &layout.tables {
        e.line(format!(
            "INTEGER(kind=4), DIMENSION(:), DEVICE, POINTER :: opMap{}Device{}",
            t.id.ordinal(),
            name
        ));
        e.line(format!("INTEGER(kind=4) :: opMap{}Cardinality", t.id.ordinal()));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        let n = i + 1;
        let ty = arg.data_type.fortran();
        if arg.is_direct() {
            e.line(format!("{}, DIMENSION(:), DEVICE, POINTER :: opDat{}Device{}", ty, n, name));
            e.line(format!("INTEGER(kind=4) :: opDat{}Cardinality", n));
        } else if arg.is_global() {
            if host_is_array(arg) {
                e.line(format!("{}, DIMENSION(:), POINTER :: opDat{}Host", ty, n));
            } else {
                e.line(format!("{}, POINTER :: opDat{}Host", ty, n));
            }
            e.line(format!("INTEGER(kind=4) :: opDat{}Cardinality", n));
            reduction::emit_host_declarations(e, arg, &layout.args[i]);
        }
    }
    e.blank();

    e.line("INTEGER(kind=4) :: blocksPerGrid");
    e.line("INTEGER(kind=4) :: threadsPerBlock");
    e.line("INTEGER(kind=4) :: dynamicSharedMemorySize");
    if layout.is_indirect() {
        e.line(format!("TYPE ( op_plan ) , POINTER :: actualPlan_{}", name));
        e.line(format!("INTEGER(kind=4), DIMENSION(1:{}) :: indirectionDescriptorArray", nargs));
        e.line("INTEGER(kind=4) :: numberOfIndirectOpDats");
        e.line("INTEGER(kind=4) :: partitionSize");
        e.line("INTEGER(kind=4) :: blockOffset");
        e.line("INTEGER(kind=4) :: pblkMapSize");
        e.line("INTEGER(kind=4) :: poffsetSize");
        e.line("INTEGER(kind=4) :: pnelemsSize");
        e.line("INTEGER(kind=4) :: pnthrcolSize");
        e.line("INTEGER(kind=4) :: pthrcolSize");
        e.line("INTEGER(kind=4), POINTER, DIMENSION(:) :: ncolblk");
        e.line("INTEGER(kind=4), DIMENSION(:), DEVICE, POINTER :: pblkMap");
        e.line("INTEGER(kind=4), DIMENSION(:), DEVICE, POINTER :: poffset");
        e.line("INTEGER(kind=4), DIMENSION(:), DEVICE, POINTER :: pnelems");
        e.line("INTEGER(kind=4), DIMENSION(:), DEVICE, POINTER :: pnthrcol");
        e.line("INTEGER(kind=4), DIMENSION(:), DEVICE, POINTER :: pthrcol");
        if layout.reorder {
            e.line("INTEGER(kind=4), DIMENSION(:), DEVICE, POINTER :: pcol_reord");
        }
        e.line("INTEGER(kind=4) :: i2");
    } else {
        e.line("REAL(kind=4) :: dataTransfer");
    }
    e.line("INTEGER(kind=4) :: i10");
    e.line("INTEGER(kind=4), SAVE :: calledTimes=0");
    e.line("INTEGER(kind=4) :: istat");
    if layout.optional_bits > 0 {
        e.line("INTEGER(kind=4) :: optflags");
    }
}

/// One `IBSET` per bit, taken from the first argument carrying it.
fn emit_flag_word(e: &mut Emitter, layout: &LoopLayout) {
    if layout.optional_bits == 0 {
        return;
    }
    e.line("optflags = 0");
    let mut seen = Vec::new();
    for (i, plan) in layout.args.iter().enumerate() {
        let Some(bit) = plan.opt_bit else { continue };
        if seen.contains(&bit) {
            continue;
        }
        seen.push(bit);
        e.if_then(format!("opArg{}%opt == 1", i + 1));
        e.line(format!("optflags = IBSET(optflags,{})", bit));
        e.end_if();
    }
    e.blank();
}

/// Refresh stride constants when the relevant set size changed.
fn emit_stride_refresh(e: &mut Emitter, layout: &LoopLayout) {
    if !layout.has_stride_constants() {
        return;
    }
    let refresh = |e: &mut Emitter, host: &str, constant: &str, arg: usize| {
        e.if_then(format!(
            "(calledTimes.EQ.0).OR.({}.NE.getSetSizeFromOpArg(opArg{}))",
            host,
            arg + 1
        ));
        e.line(format!("{} = getSetSizeFromOpArg(opArg{})", host, arg + 1));
        e.line(format!("{} = {}", constant, host));
        e.end_if();
    };
    for t in layout.tables.iter().filter(|t| t.soa) {
        refresh(e, &t.stride_host(), &t.stride_constant(), t.first_arg);
    }
    if let Some(src) = layout.direct_stride_source {
        refresh(e, DIRECT_STRIDE_HOST, DIRECT_STRIDE_CONSTANT, src);
    }
    e.blank();
}

fn emit_plan_acquisition(e: &mut Emitter, layout: &LoopLayout) {
    let name = &layout.name;
    for (i, plan) in layout.args.iter().enumerate() {
        let ind = plan.group.map_or(-1, |g| g.0 as i64);
        e.line(format!("indirectionDescriptorArray({}) = {}", i + 1, ind));
    }
    e.blank();
    e.line(format!("numberOfIndirectOpDats = {}", layout.groups.len()));
    e.blank();
    e.line("partitionSize = getPartitionSize(userSubroutine//C_NULL_CHAR,set%setPtr%size)");
    e.blank();
    e.line(format!("planRet_{} = FortranPlanCaller( &", name));
    e.indent();
    e.line("& userSubroutine//C_NULL_CHAR, &");
    e.line("& set%setCPtr, &");
    e.line("& partitionSize, &");
    e.line("& numberOfOpDats, &");
    e.line("& opArgArray, &");
    e.line("& numberOfIndirectOpDats, &");
    e.line(format!(
        "& indirectionDescriptorArray,{})",
        if layout.reorder { 3 } else { 2 }
    ));
    e.dedent();
    e.blank();
    e.line("threadsPerBlock = getBlockSize(userSubroutine//C_NULL_CHAR,set%setPtr%size)");
}

fn emit_device_pointers(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    let name = &layout.name;
    for g in &layout.groups {
        let n = g.representative + 1;
        e.line(format!(
            "opDat{n}Cardinality = opArg{n}%dim * getSetSizeFromOpArg(opArg{n})",
            n = n
        ));
    }
    for t in &layout.tables {
        e.line(format!(
            "opMap{}Cardinality = (set%setPtr%size + set%setPtr%exec_size) * getMapDimFromOpArg(opArg{})",
            t.id.ordinal(),
            t.first_arg + 1
        ));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        let n = i + 1;
        if arg.is_direct() {
            e.line(format!(
                "opDat{n}Cardinality = opArg{n}%dim * getSetSizeFromOpArg(opArg{n})",
                n = n
            ));
        } else if arg.is_global() {
            e.line(format!("opDat{n}Cardinality = opArg{n}%dim", n = n));
        }
    }
    e.blank();

    for g in &layout.groups {
        let n = g.representative + 1;
        e.line(format!(
            "CALL c_f_pointer(opArg{n}%data_d,opDat{n}Device{name},(/opDat{n}Cardinality/))",
            n = n,
            name = name
        ));
    }
    for t in &layout.tables {
        e.line(format!(
            "CALL c_f_pointer(opArg{a}%map_data_d,opMap{k}Device{name},(/opMap{k}Cardinality/))",
            a = t.first_arg + 1,
            k = t.id.ordinal(),
            name = name
        ));
    }
    for (i, arg) in desc.args.iter().enumerate() {
        let n = i + 1;
        if arg.is_direct() {
            e.line(format!(
                "CALL c_f_pointer(opArg{n}%data_d,opDat{n}Device{name},(/opDat{n}Cardinality/))",
                n = n,
                name = name
            ));
        } else if arg.is_global() {
            if host_is_array(arg) {
                e.line(format!(
                    "CALL c_f_pointer(opArg{n}%data,opDat{n}Host,(/opDat{n}Cardinality/))",
                    n = n
                ));
            } else {
                e.line(format!("CALL c_f_pointer(opArg{n}%data,opDat{n}Host)", n = n));
            }
        }
    }
    e.blank();

    if layout.is_indirect() {
        let plan = format!("actualPlan_{}", name);
        e.line(format!("CALL c_f_pointer(planRet_{},{})", name, plan));
        e.line(format!("CALL c_f_pointer({}%ncolblk,ncolblk,(/set%setPtr%size/))", plan));
        for (field, var, size) in [
            ("blkmap_d", "pblkMap", "pblkMapSize"),
            ("offset_d", "poffset", "poffsetSize"),
            ("nelems_d", "pnelems", "pnelemsSize"),
            ("nthrcol", "pnthrcol", "pnthrcolSize"),
        ] {
            e.line(format!("{} = {}%nblocks", size, plan));
            e.line(format!("CALL c_f_pointer({}%{},{},(/{}/))", plan, field, var, size));
        }
        e.line("pthrcolSize = set%setPtr%size");
        e.line(format!("CALL c_f_pointer({}%thrcol,pthrcol,(/pthrcolSize/))", plan));
        if layout.reorder {
            e.line(format!("CALL c_f_pointer({}%col_reord,pcol_reord,(/pthrcolSize/))", plan));
        }
        e.blank();
    }
}

fn emit_global_copies(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    for (i, arg) in desc.args.iter().enumerate() {
        if !has_device_copy(arg) {
            continue;
        }
        let n = i + 1;
        let dev = format!("opGblDat{}Device{}", n, layout.name);
        e.if_then(format!(".not. allocated({})", dev));
        e.line(format!("allocate({}(opArg{}%dim))", dev, n));
        e.end_if();
        e.line(format!("{d}(1:opArg{n}%dim) = opDat{n}Host(1:opArg{n}%dim)", d = dev, n = n));
        e.blank();
    }
}

fn emit_scratch(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    if layout.is_indirect() {
        // Each colour launch reuses the scratch; size it for the largest.
        e.line("blocksPerGrid = 0");
        e.do_range("i2", "0", format!("actualPlan_{}%ncolors", layout.name));
        e.line("blocksPerGrid = MAX(blocksPerGrid,ncolblk(i2 + 1))");
        e.end_do();
    }
    e.line("call prepareScratch(opArgArray,numberOfOpDats,blocksPerGrid*threadsPerBlock)");
    for (i, arg) in desc.args.iter().enumerate() {
        if arg.reduction_op().is_none() || !layout.args[i].runtime_dim {
            continue;
        }
        let n = i + 1;
        e.line(format!(
            "scratchDevice{n}Size = opArg{n}%dim*blocksPerGrid*threadsPerBlock",
            n = n
        ));
        e.line(format!(
            "call c_f_pointer(opArgArray({n})%data_d,scratchDevice{n},(/scratchDevice{n}Size/))",
            n = n
        ));
    }
    e.blank();
}

fn emit_dispatch(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    let actuals: Vec<String> = kernel::launch_args(desc, layout)
        .into_iter()
        .map(|a| a.actual)
        .collect();
    let launch = format!(
        "CALL {} <<<blocksPerGrid,threadsPerBlock,dynamicSharedMemorySize>>> (",
        kernel::kernel_name(desc)
    );
    if layout.is_indirect() {
        let plan = format!("actualPlan_{}", layout.name);
        e.line("blockOffset = 0");
        e.blank();
        e.do_range("i2", "0", format!("{}%ncolors", plan));
        // Halo elements are only safe once core colours are done.
        e.if_then(format!("i2 .EQ. {}%ncolors_core", plan));
        e.line("CALL op_mpi_wait_all_cuda(numberOfOpDats,opArgArray)");
        e.end_if();
        e.blank();
        e.line("blocksPerGrid = ncolblk(i2 + 1)");
        e.line("dynamicSharedMemorySize = reductionSize(opArgArray,numberOfOpDats) * threadsPerBlock");
        e.blank();
        e.continued(launch, &actuals, ")");
        e.blank();
        e.line("blockOffset = blockOffset + blocksPerGrid");
        e.end_do();
    } else {
        e.continued(launch, &actuals, ")");
    }
    e.blank();
}

fn emit_results(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout) {
    for (i, arg) in desc.args.iter().enumerate() {
        if !arg.is_global() {
            continue;
        }
        let n = i + 1;
        let plan = &layout.args[i];
        if arg.access == Access::Write {
            e.line(format!(
                "opDat{n}Host(1:opArg{n}%dim) = opGblDat{n}Device{name}(1:opArg{n}%dim)",
                n = n,
                name = layout.name
            ));
        }
        reduction::emit_host_combine(e, layout, arg, plan);
        if arg.reduction_op().is_some() || arg.access == Access::Write {
            e.line(format!(
                "CALL {}(opArg{n},opArg{n}%data)",
                arg.data_type.mpi_reduce(),
                n = n
            ));
            e.blank();
        }
    }
}

fn emit_instrumentation(e: &mut Emitter, desc: &KernelDescriptor, layout: &LoopLayout, kernel_index: u32) {
    let (transfer, transfer2) = if layout.is_indirect() {
        (
            format!("actualPlan_{}%transfer", layout.name),
            format!("actualPlan_{}%transfer2", layout.name),
        )
    } else {
        // READ and WRITE move their data once, everything else twice.
        e.line("dataTransfer = 0.0");
        for (i, arg) in desc.args.iter().enumerate() {
            let n = i + 1;
            let volume = if arg.is_global() {
                format!("opArg{}%size", n)
            } else {
                format!("opArg{n}%size * getSetSizeFromOpArg(opArg{n})", n = n)
            };
            match arg.access {
                Access::Read | Access::Write => {
                    e.line(format!("dataTransfer = dataTransfer + {}", volume))
                }
                Access::Rw | Access::Inc | Access::Min | Access::Max => {
                    e.line(format!("dataTransfer = dataTransfer + {} * 2.d0", volume))
                }
            }
        }
        e.blank();
        ("dataTransfer".to_string(), "0.00000_4".to_string())
    };
    e.line(format!(
        "returnSetKernelTiming = setKernelTime({} , userSubroutine//C_NULL_CHAR, &",
        kernel_index
    ));
    e.line(format!("& endTime-startTime, {},{}, 1)", transfer, transfer2));
}
