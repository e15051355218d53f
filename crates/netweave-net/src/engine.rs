//! Simulation engine seam
//!
//! The instantiation layer never integrates anything itself: it hands cells,
//! synapses and stimulus sources to a [`SimEngine`] and drives it one dt at a
//! time. [`PointEngine`] is the in-tree backend: leaky integrate-and-fire
//! point neurons with delta synapses and an event queue. It exists to make
//! the coordinator contract executable, not to be biophysically faithful.

use crate::cell::{Conn, StimRecord};
use crate::error::{NetError, Result};
use crate::ids::Gid;
use netweave_specs::{CellRule, SynMechRule, Tags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeMap};

/// Backend contract: build model objects, accept events, advance in steps
pub trait SimEngine {
    /// Build the model object for one cell from its matched rule
    fn build_cell(&mut self, gid: Gid, rule: &CellRule, tags: &Tags) -> Result<()>;

    /// Instantiate the receiving side of one connection on its target cell
    fn add_synapse(&mut self, conn: &Conn, mech: Option<&SynMechRule>) -> Result<()>;

    /// Attach an independent stimulus source to a cell
    fn add_stim(&mut self, post: Gid, stim: &StimRecord, seed: u64) -> Result<()>;

    /// Queue a weighted event for delivery to a local cell at `time_ms`
    fn deliver(&mut self, post: Gid, time_ms: f64, weight: f64);

    /// Advance all local cells from `t_ms` by `dt_ms`; returns cells that
    /// spiked during the step, in gid order
    fn advance(&mut self, t_ms: f64, dt_ms: f64) -> Vec<Gid>;

    /// Read a recordable state variable ("v" on the soma for point cells)
    fn read_state(&self, gid: Gid, sec: &str, var: &str) -> Option<f64>;

    /// Number of model objects built
    fn num_cells(&self) -> usize;
}

/// Leaky integrate-and-fire point neuron
#[derive(Debug, Clone)]
struct PointNeuron {
    v: f64,
    v_rest: f64,
    v_thresh: f64,
    v_reset: f64,
    tau_m: f64,
    refrac_ms: f64,
    refrac_until: f64,
}

impl PointNeuron {
    fn from_params(params: &BTreeMap<String, f64>) -> std::result::Result<Self, String> {
        let tau_m = params.get("tau").copied().unwrap_or(10.0);
        if tau_m <= 0.0 {
            return Err(format!("membrane time constant must be > 0, got {}", tau_m));
        }
        let refrac_ms = params.get("refrac").copied().unwrap_or(2.0);
        if refrac_ms < 0.0 {
            return Err(format!("refractory period must be >= 0, got {}", refrac_ms));
        }
        let v_rest = params.get("vrest").copied().unwrap_or(-65.0);
        Ok(Self {
            v: v_rest,
            v_rest,
            v_thresh: params.get("vthresh").copied().unwrap_or(-50.0),
            v_reset: params.get("vreset").copied().unwrap_or(-65.0),
            tau_m,
            refrac_ms,
            refrac_until: f64::NEG_INFINITY,
        })
    }

    /// One Euler step; returns true on a threshold crossing
    fn step(&mut self, t: f64, dt: f64) -> bool {
        if t < self.refrac_until {
            self.v = self.v_reset;
            return false;
        }
        self.v += dt * (self.v_rest - self.v) / self.tau_m;
        if self.v >= self.v_thresh {
            self.v = self.v_reset;
            self.refrac_until = t + dt + self.refrac_ms;
            return true;
        }
        false
    }
}

/// Pending weighted delivery
#[derive(Debug, Clone, PartialEq)]
struct Event {
    time: f64,
    post: Gid,
    weight: f64,
    seq: u64,
}

impl Eq for Event {}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops earliest-first; seq keeps
        // same-time deliveries in insertion order
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.post.cmp(&self.post))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A Poisson-like stimulus source attached to one cell
#[derive(Debug)]
struct StimState {
    post: Gid,
    weight: f64,
    delay: f64,
    mean_interval: f64,
    noise: f64,
    next_spike: f64,
    rng: StdRng,
}

impl StimState {
    /// Interval to the next source spike: a (1-noise) fixed part plus a
    /// noise-scaled exponential part
    fn draw_interval(&mut self) -> f64 {
        let fixed = self.mean_interval * (1.0 - self.noise);
        let u: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let exp = -u.ln() * self.mean_interval * self.noise;
        fixed + exp
    }
}

/// Reference event-driven point-neuron backend
#[derive(Debug, Default)]
pub struct PointEngine {
    cells: BTreeMap<Gid, PointNeuron>,
    events: BinaryHeap<Event>,
    stims: Vec<StimState>,
    next_seq: u64,
}

impl PointEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    fn push_event(&mut self, post: Gid, time: f64, weight: f64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(Event {
            time,
            post,
            weight,
            seq,
        });
    }
}

impl SimEngine for PointEngine {
    fn build_cell(&mut self, gid: Gid, rule: &CellRule, _tags: &Tags) -> Result<()> {
        let params = rule
            .secs
            .get("soma")
            .and_then(|sec| sec.pointps.get("lif"))
            .cloned()
            .unwrap_or_default();
        let neuron = PointNeuron::from_params(&params).map_err(|reason| NetError::EngineBuild {
            gid: gid.raw(),
            rule: rule.label.clone(),
            reason,
        })?;
        self.cells.insert(gid, neuron);
        Ok(())
    }

    fn add_synapse(&mut self, conn: &Conn, _mech: Option<&SynMechRule>) -> Result<()> {
        // Delta synapses carry no state; the weight is applied at delivery.
        // The target must exist locally.
        if !self.cells.contains_key(&conn.post) {
            return Err(NetError::UnregisteredGid {
                gid: conn.post.raw(),
            });
        }
        Ok(())
    }

    fn add_stim(&mut self, post: Gid, stim: &StimRecord, seed: u64) -> Result<()> {
        if !self.cells.contains_key(&post) {
            return Err(NetError::UnregisteredGid { gid: post.raw() });
        }
        let mut state = StimState {
            post,
            weight: stim.weight,
            delay: stim.delay,
            mean_interval: 1000.0 / stim.source.rate_hz,
            noise: stim.source.noise.clamp(0.0, 1.0),
            next_spike: stim.source.start_ms,
            rng: StdRng::seed_from_u64(seed),
        };
        let first = state.draw_interval();
        state.next_spike += first;
        self.stims.push(state);
        Ok(())
    }

    fn deliver(&mut self, post: Gid, time_ms: f64, weight: f64) {
        self.push_event(post, time_ms, weight);
    }

    fn advance(&mut self, t_ms: f64, dt_ms: f64) -> Vec<Gid> {
        let end = t_ms + dt_ms;

        // Emit stimulus spikes falling inside this step
        let mut due = Vec::new();
        for stim in &mut self.stims {
            while stim.next_spike < end {
                due.push((stim.post, stim.next_spike + stim.delay, stim.weight));
                let interval = stim.draw_interval();
                stim.next_spike += interval;
            }
        }
        for (post, time, weight) in due {
            self.push_event(post, time, weight);
        }

        // Apply deliveries due this step
        while self.events.peek().is_some_and(|ev| ev.time < end) {
            let Some(ev) = self.events.pop() else { break };
            if let Some(cell) = self.cells.get_mut(&ev.post) {
                if t_ms >= cell.refrac_until {
                    cell.v += ev.weight;
                }
            }
        }

        // Integrate and detect threshold crossings
        let mut spikes = Vec::new();
        for (gid, cell) in &mut self.cells {
            if cell.step(t_ms, dt_ms) {
                spikes.push(*gid);
            }
        }
        spikes
    }

    fn read_state(&self, gid: Gid, sec: &str, var: &str) -> Option<f64> {
        if sec != "soma" || var != "v" {
            return None;
        }
        self.cells.get(&gid).map(|c| c.v)
    }

    fn num_cells(&self) -> usize {
        self.cells.len()
    }
}
