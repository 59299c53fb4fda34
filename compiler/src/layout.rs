// layout.rs — Layout planner
//
// Resolves, once per loop, every generation-time decision the synthesizers
// need: which dimensions are runtime parameters, how each argument reaches
// the per-element body, optional-argument bits, shared map address slots,
// the loop shape, and which reduction routines must be emitted.
//
// Preconditions: the descriptor passed `KernelDescriptor::validate`.
// Postconditions: ids (groups, slots, tables, bits) follow argument order;
//                 every argument has exactly one `Realisation`.
// Failure modes: E0001 (INC/RW indirect with runtime dimension),
//                E0002 (staged argument with runtime dimension),
//                E0003 (more optional arguments than flag bits).
// Side effects: debug logging only.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::config::GenOptions;
use crate::descriptor::{Access, ArgKind, ArgumentDescriptor, DataType, KernelDescriptor};
use crate::diag::{codes, Diagnostic};
use crate::dim::Dim;
use crate::id::{GroupId, IdAllocator, OptBit, SlotId, TableId};

// ── Plan types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopShape {
    /// No indirect arguments: grid-stride loop, no barriers.
    Direct,
    /// Plan-driven blocks; `colored` when any argument is an `INC`/`RW`
    /// indirect update and must be scheduled colour by colour.
    Indirect { colored: bool },
}

/// How an argument reaches the per-element body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Realisation {
    /// Row-major slice of a directly indexed dataset.
    Direct,
    /// Row-major slice through a cached map address (`READ`/`WRITE`).
    Indirect,
    /// Base of stride-addressed storage; the body is rewritten to match.
    StrideRewrite,
    /// Per-thread contiguous copy of stride-addressed storage.
    Staged,
    /// Zeroed per-thread accumulator added back after the colour barrier.
    Accumulator,
    /// Per-thread copy gathered inside the colour, written back after its barrier.
    Deferred,
    /// Loop-invariant value or reduction target.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndirectGroup {
    pub id: GroupId,
    pub dataset: String,
    pub map: String,
    /// First argument using this (dataset, map) pair.
    pub representative: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapSlot {
    pub id: SlotId,
    pub table: TableId,
    pub column: u32,
    /// Address computed only when one of these bits is set; empty means
    /// always (some user is not optional).
    pub gate: Vec<OptBit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapTable {
    pub id: TableId,
    pub map: String,
    /// First argument through this map; the host takes the map pointer
    /// and the target set size from it.
    pub first_arg: usize,
    /// Some dataset reached through this map is stride-addressed.
    pub soa: bool,
}

impl MapTable {
    pub fn stride_constant(&self) -> String {
        format!("opMap{}_stride_OP2CONSTANT", self.id.ordinal())
    }

    pub fn stride_host(&self) -> String {
        format!("opMap{}_stride_OP2HOST", self.id.ordinal())
    }
}

pub const DIRECT_STRIDE_CONSTANT: &str = "direct_stride_OP2CONSTANT";
pub const DIRECT_STRIDE_HOST: &str = "direct_stride_OP2HOST";

/// Block reduction routine needed by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ReductionRoutine {
    pub data_type: DataType,
    pub vector: bool,
}

impl ReductionRoutine {
    pub fn name(&self) -> String {
        format!(
            "Reduction{}{}",
            self.data_type.reduction_suffix().unwrap_or("Float8"),
            if self.vector { "Mdim" } else { "" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgPlan {
    pub index: usize,
    /// Dimension only known when the loop runs.
    pub runtime_dim: bool,
    /// Dimension as written in device code.
    pub kernel_dim: String,
    /// Dimension as written in the host stub.
    pub host_dim: String,
    /// Stride-addressed and visible as such to the body.
    pub needs_staging: bool,
    pub opt_bit: Option<OptBit>,
    pub group: Option<GroupId>,
    pub slot: Option<SlotId>,
    /// Stride constant for device addressing of stride-addressed storage.
    pub stride: Option<String>,
    pub realisation: Realisation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopLayout {
    pub name: String,
    pub shape: LoopShape,
    pub reorder: bool,
    pub args: Vec<ArgPlan>,
    pub groups: Vec<IndirectGroup>,
    pub slots: Vec<MapSlot>,
    pub tables: Vec<MapTable>,
    /// Direct stride-addressed argument whose set size defines the direct stride.
    pub direct_stride_source: Option<usize>,
    pub optional_bits: u32,
    /// Some reduction has a runtime dimension; every thread indexes a
    /// `threads x blocks x dim` scratch buffer instead of local storage.
    pub unknown_reduction_scratch: bool,
    pub reductions: BTreeSet<ReductionRoutine>,
}

impl LoopLayout {
    pub fn is_indirect(&self) -> bool {
        matches!(self.shape, LoopShape::Indirect { .. })
    }

    pub fn is_colored(&self) -> bool {
        matches!(self.shape, LoopShape::Indirect { colored: true })
    }

    pub fn group(&self, id: GroupId) -> &IndirectGroup {
        &self.groups[id.0 as usize]
    }

    pub fn slot(&self, id: SlotId) -> &MapSlot {
        &self.slots[id.0 as usize]
    }

    pub fn table(&self, id: TableId) -> &MapTable {
        &self.tables[id.0 as usize]
    }

    /// Device array holding argument `i`'s data (shared by an indirect group).
    pub fn data_name(&self, i: usize) -> String {
        let owner = match self.args[i].group {
            Some(g) => self.group(g).representative,
            None => i,
        };
        format!("opDat{}Device{}", owner + 1, self.name)
    }

    /// Local index variable holding argument `i`'s cached map address.
    pub fn slot_var(&self, i: usize) -> Option<String> {
        self.args[i].slot.map(|s| format!("map{}idx", s.ordinal()))
    }

    pub fn has_stride_constants(&self) -> bool {
        self.direct_stride_source.is_some() || self.tables.iter().any(|t| t.soa)
    }
}

// ── Planner ────────────────────────────────────────────────────────────────

/// Plan a loop. `body_calls_routines` selects staging over in-place body
/// rewrite for stride-addressed arguments.
pub fn plan(
    desc: &KernelDescriptor,
    opts: &GenOptions,
    body_calls_routines: bool,
) -> Result<LoopLayout, Diagnostic> {
    let mut ids = IdAllocator::new();
    let groups: Vec<IndirectGroup> = desc
        .indirect_datasets()
        .into_iter()
        .map(|d| IndirectGroup {
            id: ids.alloc_group(),
            dataset: d.dataset,
            map: d.map,
            representative: d.representative,
        })
        .collect();
    let mut tables: Vec<MapTable> = Vec::new();
    let mut slot_keys: Vec<(TableId, u32)> = Vec::new();

    let mut arg_group = vec![None; desc.args.len()];
    let mut arg_table = vec![None; desc.args.len()];
    let mut arg_slot = vec![None; desc.args.len()];

    for (i, arg) in desc.args.iter().enumerate() {
        let Some(m) = arg.map_ref() else { continue };

        arg_group[i] = groups
            .iter()
            .find(|g| g.dataset == arg.dataset && g.map == m.map)
            .map(|g| g.id);

        let table = match tables.iter_mut().find(|t| t.map == m.map) {
            Some(t) => {
                t.soa |= arg.structure_of_arrays;
                t.id
            }
            None => {
                let id = ids.alloc_table();
                tables.push(MapTable {
                    id,
                    map: m.map.clone(),
                    first_arg: i,
                    soa: arg.structure_of_arrays,
                });
                id
            }
        };
        arg_table[i] = Some(table);

        let slot = match slot_keys.iter().position(|&(t, c)| t == table && c == m.column) {
            Some(k) => SlotId(k as u32),
            None => {
                let id = ids.alloc_slot();
                slot_keys.push((table, m.column));
                id
            }
        };
        arg_slot[i] = Some(slot);
    }

    let opt_bits = assign_optional_bits(desc, &arg_group, &mut ids);
    if ids.bits_used() > opts.optional_flag_bits {
        return Err(Diagnostic::error(
            codes::E0003,
            &desc.name,
            format!(
                "{} optional arguments need {} flag bits, the flag word has {}",
                desc.args.iter().filter(|a| a.optional).count(),
                ids.bits_used(),
                opts.optional_flag_bits
            ),
        )
        .with_hint("raise optional_flag_bits or make fewer arguments optional"));
    }

    let slots: Vec<MapSlot> = slot_keys
        .iter()
        .enumerate()
        .map(|(k, &(table, column))| {
            let users: Vec<usize> = (0..desc.args.len())
                .filter(|&i| arg_slot[i] == Some(SlotId(k as u32)))
                .collect();
            let gate = if users.iter().all(|&i| opt_bits[i].is_some()) {
                let bits: BTreeSet<OptBit> = users.iter().filter_map(|&i| opt_bits[i]).collect();
                bits.into_iter().collect()
            } else {
                Vec::new()
            };
            MapSlot {
                id: SlotId(k as u32),
                table,
                column,
                gate,
            }
        })
        .collect();

    let direct_stride_source = desc
        .args
        .iter()
        .position(|a| a.is_direct() && a.structure_of_arrays);

    let mut args = Vec::with_capacity(desc.args.len());
    for (i, arg) in desc.args.iter().enumerate() {
        let owner = arg_group[i].map_or(i, |g| groups[g.0 as usize].representative);
        let runtime_dim = is_runtime_dim(&arg.dim, opts);
        let (kernel_dim, host_dim) = if runtime_dim {
            (format!("opDat{}Dim", owner + 1), format!("opArg{}%dim", owner + 1))
        } else {
            (arg.dim.to_string(), arg.dim.to_string())
        };

        if runtime_dim && arg.is_indirect_update() {
            return Err(Diagnostic::error(
                codes::E0001,
                &desc.name,
                format!(
                    "{} indirect argument has runtime dimension '{}'; per-thread storage cannot be sized",
                    arg.access.as_str(),
                    arg.dim
                ),
            )
            .with_arg(i)
            .with_hint("use a literal dimension or add its name to global_constants"));
        }

        let needs_staging = arg.effective_soa();
        let realisation = realise(arg, needs_staging, body_calls_routines);
        if realisation == Realisation::Staged && runtime_dim {
            return Err(Diagnostic::error(
                codes::E0002,
                &desc.name,
                format!(
                    "staged argument has runtime dimension '{}'; the staging copy cannot be sized",
                    arg.dim
                ),
            )
            .with_arg(i));
        }

        let stride = if arg.structure_of_arrays && !arg.is_global() {
            Some(match arg_table[i] {
                Some(t) => tables[t.0 as usize].stride_constant(),
                None => DIRECT_STRIDE_CONSTANT.to_string(),
            })
        } else {
            None
        };

        args.push(ArgPlan {
            index: i,
            runtime_dim,
            kernel_dim,
            host_dim,
            needs_staging,
            opt_bit: opt_bits[i],
            group: arg_group[i],
            slot: arg_slot[i],
            stride,
            realisation,
        });
    }

    let shape = if groups.is_empty() {
        LoopShape::Direct
    } else {
        LoopShape::Indirect {
            colored: desc.args.iter().any(ArgumentDescriptor::is_indirect_update),
        }
    };

    let unknown_reduction_scratch = desc
        .args
        .iter()
        .zip(&args)
        .any(|(a, p)| a.reduction_op().is_some() && p.runtime_dim);

    let reductions: BTreeSet<ReductionRoutine> = desc
        .args
        .iter()
        .filter(|a| a.reduction_op().is_some())
        .map(|a| ReductionRoutine {
            data_type: a.data_type,
            vector: !a.dim.is_scalar(),
        })
        .collect();

    log::debug!(
        "plan {}: {:?}, {} groups, {} slots, {} maps, {} optional bits, scratch={}",
        desc.name,
        shape,
        groups.len(),
        slots.len(),
        tables.len(),
        ids.bits_used(),
        unknown_reduction_scratch
    );

    Ok(LoopLayout {
        name: desc.name.clone(),
        shape,
        reorder: desc.reorder,
        args,
        groups,
        slots,
        tables,
        direct_stride_source,
        optional_bits: ids.bits_used(),
        unknown_reduction_scratch,
        reductions,
    })
}

/// A symbolic dimension stays symbolic in device code only when every
/// identifier in it is a module constant.
pub fn is_runtime_dim(dim: &Dim, opts: &GenOptions) -> bool {
    match dim {
        Dim::Fixed(_) => false,
        Dim::Symbolic(e) => !e.symbols().iter().all(|s| opts.is_global_constant(s)),
    }
}

fn realise(arg: &ArgumentDescriptor, needs_staging: bool, body_calls_routines: bool) -> Realisation {
    match (&arg.kind, arg.access) {
        (ArgKind::Global, _) => Realisation::Global,
        (ArgKind::Indirect(_), Access::Inc) => Realisation::Accumulator,
        (ArgKind::Indirect(_), Access::Rw) => Realisation::Deferred,
        _ if needs_staging && body_calls_routines => Realisation::Staged,
        _ if needs_staging => Realisation::StrideRewrite,
        (ArgKind::Direct, _) => Realisation::Direct,
        (ArgKind::Indirect(_), _) => Realisation::Indirect,
    }
}

/// Bits in first-seen order; later members of an indirect group reuse the
/// group's bit.
fn assign_optional_bits(
    desc: &KernelDescriptor,
    arg_group: &[Option<GroupId>],
    ids: &mut IdAllocator,
) -> Vec<Option<OptBit>> {
    let mut group_bits: HashMap<GroupId, OptBit> = HashMap::new();
    desc.args
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            if !arg.optional {
                return None;
            }
            Some(match arg_group[i] {
                Some(g) => *group_bits.entry(g).or_insert_with(|| ids.alloc_bit()),
                None => ids.alloc_bit(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MapRef;

    fn arg(dataset: &str, kind: ArgKind, access: Access, dim: Dim) -> ArgumentDescriptor {
        ArgumentDescriptor {
            dataset: dataset.into(),
            kind,
            access,
            data_type: DataType::Real8,
            dim,
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

    fn kernel(args: Vec<ArgumentDescriptor>) -> KernelDescriptor {
        KernelDescriptor {
            name: "res_calc".into(),
            set: "edges".into(),
            args,
            reorder: false,
        }
    }

    fn sym(s: &str) -> Dim {
        Dim::parse(s).unwrap()
    }

    #[test]
    fn direct_loop_shape() {
        let k = kernel(vec![arg("q", ArgKind::Direct, Access::Rw, Dim::Fixed(4))]);
        let l = plan(&k, &GenOptions::default(), false).unwrap();
        assert_eq!(l.shape, LoopShape::Direct);
        assert_eq!(l.args[0].realisation, Realisation::Direct);
        assert!(l.groups.is_empty());
    }

    #[test]
    fn groups_slots_and_tables() {
        let k = kernel(vec![
            arg("x", via("pedge", 0), Access::Read, Dim::Fixed(2)),
            arg("x", via("pedge", 1), Access::Read, Dim::Fixed(2)),
            arg("res", via("pecell", 0), Access::Inc, Dim::Fixed(4)),
            arg("q", via("pecell", 0), Access::Read, Dim::Fixed(4)),
        ]);
        let l = plan(&k, &GenOptions::default(), false).unwrap();
        assert_eq!(l.shape, LoopShape::Indirect { colored: true });
        assert_eq!(l.groups.len(), 3);
        assert_eq!(l.tables.len(), 2);
        assert_eq!(l.slots.len(), 3);
        // Same (map, column) shares one cached address.
        assert_eq!(l.args[2].slot, l.args[3].slot);
        assert_eq!(l.data_name(1), "opDat1Deviceres_calc");
        assert_eq!(l.slot_var(3).as_deref(), Some("map3idx"));
        assert_eq!(l.args[2].realisation, Realisation::Accumulator);
        assert_eq!(l.args[0].realisation, Realisation::Indirect);
    }

    #[test]
    fn read_only_indirect_is_uncolored() {
        let k = kernel(vec![arg("x", via("m", 0), Access::Read, Dim::Fixed(2))]);
        let l = plan(&k, &GenOptions::default(), false).unwrap();
        assert_eq!(l.shape, LoopShape::Indirect { colored: false });
    }

    #[test]
    fn optional_bits_shared_within_group() {
        let mut a0 = arg("x", via("m", 0), Access::Read, Dim::Fixed(2));
        let mut a1 = arg("x", via("m", 1), Access::Read, Dim::Fixed(2));
        let mut a2 = arg("w", ArgKind::Direct, Access::Read, Dim::Fixed(1));
        a0.optional = true;
        a1.optional = true;
        a2.optional = true;
        let l = plan(&kernel(vec![a0, a1, a2]), &GenOptions::default(), false).unwrap();
        assert_eq!(l.args[0].opt_bit, Some(OptBit(0)));
        assert_eq!(l.args[1].opt_bit, Some(OptBit(0)));
        assert_eq!(l.args[2].opt_bit, Some(OptBit(1)));
        assert_eq!(l.optional_bits, 2);
        assert_eq!(l.slots[0].gate, vec![OptBit(0)]);
    }

    #[test]
    fn slot_ungated_when_any_user_required() {
        let mut a0 = arg("x", via("m", 0), Access::Read, Dim::Fixed(2));
        a0.optional = true;
        let a1 = arg("y", via("m", 0), Access::Read, Dim::Fixed(2));
        let l = plan(&kernel(vec![a0, a1]), &GenOptions::default(), false).unwrap();
        assert!(l.slots[0].gate.is_empty());
    }

    #[test]
    fn too_many_optional_arguments() {
        let args: Vec<ArgumentDescriptor> = (0..3)
            .map(|i| {
                let mut a = arg(&format!("d{}", i), ArgKind::Direct, Access::Read, Dim::Fixed(1));
                a.optional = true;
                a
            })
            .collect();
        let opts = GenOptions {
            optional_flag_bits: 2,
            ..GenOptions::default()
        };
        let err = plan(&kernel(args), &opts, false).unwrap_err();
        assert_eq!(err.code, Some(codes::E0003));
        assert_eq!(err.loop_name, "res_calc");
    }

    #[test]
    fn recognized_constants_stay_symbolic() {
        let k = kernel(vec![
            arg("a", ArgKind::Direct, Access::Read, sym("NPDE*2")),
            arg("b", ArgKind::Direct, Access::Read, sym("nvar")),
        ]);
        let l = plan(&k, &GenOptions::default(), false).unwrap();
        assert!(!l.args[0].runtime_dim);
        assert_eq!(l.args[0].kernel_dim, "NPDE*2");
        assert!(l.args[1].runtime_dim);
        assert_eq!(l.args[1].kernel_dim, "opDat2Dim");
        assert_eq!(l.args[1].host_dim, "opArg2%dim");
    }

    #[test]
    fn inc_indirect_runtime_dim_rejected() {
        let k = kernel(vec![
            arg("x", ArgKind::Direct, Access::Read, Dim::Fixed(1)),
            arg("res", via("m", 0), Access::Inc, sym("nvar")),
        ]);
        let err = plan(&k, &GenOptions::default(), false).unwrap_err();
        assert_eq!(err.code, Some(codes::E0001));
        assert_eq!(err.arg, Some(1));
    }

    #[test]
    fn staging_versus_rewrite() {
        let mut q = arg("q", ArgKind::Direct, Access::Rw, Dim::Fixed(4));
        q.structure_of_arrays = true;
        let k = kernel(vec![q]);
        let rewritten = plan(&k, &GenOptions::default(), false).unwrap();
        assert_eq!(rewritten.args[0].realisation, Realisation::StrideRewrite);
        assert_eq!(rewritten.args[0].stride.as_deref(), Some(DIRECT_STRIDE_CONSTANT));
        assert_eq!(rewritten.direct_stride_source, Some(0));
        let staged = plan(&k, &GenOptions::default(), true).unwrap();
        assert_eq!(staged.args[0].realisation, Realisation::Staged);
    }

    #[test]
    fn staged_runtime_dim_rejected() {
        let mut q = arg("q", ArgKind::Direct, Access::Rw, sym("nvar"));
        q.structure_of_arrays = true;
        let err = plan(&kernel(vec![q]), &GenOptions::default(), true).unwrap_err();
        assert_eq!(err.code, Some(codes::E0002));
    }

    #[test]
    fn soa_inc_indirect_is_not_staged_but_strided() {
        let mut res = arg("res", via("m", 0), Access::Inc, Dim::Fixed(4));
        res.structure_of_arrays = true;
        let l = plan(&kernel(vec![res]), &GenOptions::default(), true).unwrap();
        assert!(!l.args[0].needs_staging);
        assert_eq!(l.args[0].realisation, Realisation::Accumulator);
        assert_eq!(l.args[0].stride.as_deref(), Some("opMap1_stride_OP2CONSTANT"));
        assert!(l.tables[0].soa);
    }

    #[test]
    fn reductions_and_scratch() {
        let mut min = arg("lo", ArgKind::Global, Access::Min, Dim::Fixed(1));
        min.data_type = DataType::Int4;
        let k = kernel(vec![
            arg("q", ArgKind::Direct, Access::Read, Dim::Fixed(1)),
            arg("rms", ArgKind::Global, Access::Inc, Dim::Fixed(1)),
            arg("acc", ArgKind::Global, Access::Inc, sym("nvar")),
            min,
        ]);
        let l = plan(&k, &GenOptions::default(), false).unwrap();
        assert!(l.unknown_reduction_scratch);
        let names: Vec<String> = l.reductions.iter().map(ReductionRoutine::name).collect();
        assert_eq!(
            names,
            vec!["ReductionFloat8", "ReductionFloat8Mdim", "ReductionInt4"]
        );
    }
}
