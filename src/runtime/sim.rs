//! Recording accelerator.
//!
//! Implements [`Accelerator`] without hardware: every primitive is
//! appended to an event log and charged a fixed cycle cost. Used by the
//! `run` command to dry-run blobs and by tests to observe what the
//! scheduler issued.

use serde::Serialize;

use super::{Accelerator, KernelCall, LaneConfig};
use crate::ir::{LayerKind, LayerParams, PadConfig, Scatter, Segment, SyncKind, Transfer};

/// Cycle costs of the simulated primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleModel {
    /// Control-processor cost of one register write.
    pub register_write: u64,
    /// Cost per element moved by the DMA engines.
    pub per_element: u64,
    /// Fixed cost per transfer the DMA engine decodes.
    pub per_transfer: u64,
    /// Cost per vector element of a kernel.
    pub per_kernel_element: u64,
}

impl Default for CycleModel {
    fn default() -> Self {
        Self {
            register_write: 1,
            per_element: 1,
            per_transfer: 8,
            per_kernel_element: 1,
        }
    }
}

/// One primitive the scheduler issued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum Event {
    Pad(PadConfig),
    /// A batch fetch: its record count and the transfers it expands to.
    Block { records: usize, transfers: Vec<Transfer> },
    Dma { transfer: Transfer },
    Wait { kind: SyncKind },
    Config { setting: LaneConfig },
    Nops { count: u32 },
    Kernel { call: KernelCall },
    DynamicShape { layer: u16 },
    Scatter { layer: u16, commands: usize, via_dma: bool },
    PreLayer { entry: usize, layer: u16 },
    PostLayer { entry: usize, layer: u16 },
}

fn expand(segment: &Segment) -> Vec<Transfer> {
    match segment {
        Segment::Transfer(t) => vec![*t],
        Segment::Loop(l) => l.expand(),
        _ => Vec::new(),
    }
}

/// Accelerator that records instead of executing.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    pub model: CycleModel,
    /// Points per pillar segment reported to point-pillar layers.
    pub pillar_points: Vec<u16>,
    /// Work the DMA and lane sides have queued beyond `now`.
    dma_busy: u64,
    lanes_busy: u64,
    now: u64,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pillar_points(mut self, points: Vec<u16>) -> Self {
        self.pillar_points = points;
        self
    }

    /// Every transfer handed to the DMA engines, in issue order.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.events
            .iter()
            .flat_map(|e| match e {
                Event::Block { transfers, .. } => transfers.clone(),
                Event::Dma { transfer } => vec![*transfer],
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn kernels(&self) -> Vec<KernelCall> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Kernel { call } => Some(*call),
                _ => None,
            })
            .collect()
    }

    pub fn configs(&self) -> Vec<LaneConfig> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Config { setting } => Some(*setting),
                _ => None,
            })
            .collect()
    }

    pub fn waits(&self) -> Vec<SyncKind> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Wait { kind } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn queue_dma(&mut self, transfers: &[Transfer]) {
        let cost: u64 = transfers
            .iter()
            .map(|t| self.model.per_transfer + t.elements() * self.model.per_element)
            .sum();
        self.dma_busy = self.dma_busy.max(self.now) + cost;
    }
}

impl Accelerator for Recorder {
    fn set_pad(&mut self, pad: &PadConfig) {
        self.now += 5 * self.model.register_write;
        self.events.push(Event::Pad(*pad));
    }

    fn dma_block(&mut self, records: &[Segment]) {
        let transfers: Vec<Transfer> = records.iter().flat_map(expand).collect();
        self.now += 2 * self.model.register_write;
        self.queue_dma(&transfers);
        self.events.push(Event::Block {
            records: records.iter().map(Segment::wire_len).sum(),
            transfers,
        });
    }

    fn dma_issue(&mut self, segment: &Segment) {
        for transfer in expand(segment) {
            self.now += 8 * self.model.register_write;
            self.queue_dma(&[transfer]);
            self.events.push(Event::Dma { transfer });
        }
    }

    fn wait(&mut self, kind: SyncKind) {
        let until = match kind {
            SyncKind::Dma => self.dma_busy,
            SyncKind::Lanes => self.lanes_busy,
            SyncKind::Both => self.dma_busy.max(self.lanes_busy),
        };
        self.now = self.now.max(until);
        self.events.push(Event::Wait { kind });
    }

    fn configure(&mut self, setting: LaneConfig) {
        self.now += self.model.register_write;
        self.events.push(Event::Config { setting });
    }

    fn nops(&mut self, count: u32) {
        self.lanes_busy = self.lanes_busy.max(self.now) + count as u64;
        self.events.push(Event::Nops { count });
    }

    fn kernel(&mut self, call: &KernelCall) {
        let c = &call.cmd;
        let vector = (c.xend as u64 + 1) * (c.yend as u64 + 1) * (c.zend as u64 + 1);
        self.now += self.model.register_write;
        self.lanes_busy = self.lanes_busy.max(self.now) + vector * self.model.per_kernel_element + call.compensate as u64;
        self.events.push(Event::Kernel { call: *call });
    }

    fn cycles(&self) -> u64 {
        self.now
    }

    fn point_counts(&mut self, _params: &LayerParams) -> Vec<u16> {
        self.pillar_points.clone()
    }

    /// Largest transfer row of the batch stands in for the point-dependent length.
    fn dynamic_block(&mut self, records: &[Segment], _point_counts: &[u16]) -> u16 {
        records
            .iter()
            .flat_map(expand)
            .map(|t| t.x_size)
            .max()
            .unwrap_or(0)
    }

    fn dynamic_shape(&mut self, params: &LayerParams) {
        self.events.push(Event::DynamicShape { layer: params.number });
    }

    fn scatter(&mut self, params: &LayerParams, commands: &[Scatter], via_dma: bool) {
        debug_assert_eq!(params.kind, LayerKind::ScatterToGrid);
        let bytes: u64 = commands.iter().map(|c| c.memcopy_size as u64).sum();
        if via_dma {
            self.dma_busy = self.dma_busy.max(self.now) + bytes * self.model.per_element;
        } else {
            self.now += bytes * self.model.per_element;
        }
        self.events.push(Event::Scatter {
            layer: params.number,
            commands: commands.len(),
            via_dma,
        });
    }

    fn pre_layer(&mut self, entry: usize, _total: usize, params: &LayerParams) {
        self.events.push(Event::PreLayer {
            entry,
            layer: params.number,
        });
    }

    fn post_layer(&mut self, entry: usize, _total: usize, params: &LayerParams) {
        self.events.push(Event::PostLayer {
            entry,
            layer: params.number,
        });
    }
}
