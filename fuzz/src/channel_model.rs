//! In-memory replica of the driver/executor handshake.
//!
//! Both parties share a state, a transfer size and a buffer exactly as on
//! the real channel, but each side moves one step at a time under the
//! control of a schedule. A side whose turn it is not reports `Waiting`,
//! which stands in for the spin (driver) or futex sleep (executor).
//!
//! Invariants checked after every step:
//! - The transfer size never exceeds the capacity
//! - Idle, Await and Shutdown carry no payload
//! - In Await exactly one side has a message in flight
//! - Idle means no exchange is half done on either side
//! - The executor only stops in Shutdown

use std::collections::VecDeque;

use shmcall::State;

/// Which party takes the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Driver,
    Executor,
}

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The side changed the shared state.
    Moved,
    /// Not this side's turn.
    Waiting,
    /// The channel is shut down.
    Done,
}

/// The model operation: reverse the request and append a marker, so
/// responses are one unit longer than requests and cross chunk
/// boundaries at different points.
pub fn respond(request: &str) -> String {
    let mut response: String = request.chars().rev().collect();
    response.push('!');
    response
}

/// A message being written out chunk by chunk.
#[derive(Debug)]
struct Outgoing {
    units: Vec<char>,
    offset: usize,
}

impl Outgoing {
    fn new(message: &str) -> Self {
        Self {
            units: message.chars().collect(),
            offset: 0,
        }
    }

    /// Fill `buffer` with the next chunk. Returns its length and whether it
    /// is the last one.
    fn write_next(&mut self, buffer: &mut [char]) -> (usize, bool) {
        let len = (self.units.len() - self.offset).min(buffer.len());
        buffer[..len].copy_from_slice(&self.units[self.offset..self.offset + len]);
        self.offset += len;
        (len, self.offset == self.units.len())
    }
}

#[derive(Debug, Default)]
struct DriverModel {
    pending: VecDeque<String>,
    outgoing: Option<Outgoing>,
    incoming: Option<String>,
    responses: Vec<String>,
}

#[derive(Debug, Default)]
struct ExecutorModel {
    incoming: String,
    outgoing: Option<Outgoing>,
    requests: Vec<String>,
    stopped: bool,
}

/// Shared channel plus the private progress of each side.
#[derive(Debug)]
pub struct ChannelModel {
    state: State,
    transfer_size: usize,
    buffer: Vec<char>,
    driver: DriverModel,
    executor: ExecutorModel,
    history: Vec<State>,
}

impl ChannelModel {
    /// A fresh channel whose driver will send `messages` in order and then
    /// request shutdown.
    pub fn new(capacity: usize, messages: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: State::Idle,
            transfer_size: 0,
            buffer: vec!['\0'; capacity.max(1)],
            driver: DriverModel {
                pending: messages.into_iter().collect(),
                ..Default::default()
            },
            executor: ExecutorModel::default(),
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[State] {
        &self.history
    }

    pub fn responses(&self) -> &[String] {
        &self.driver.responses
    }

    pub fn requests(&self) -> &[String] {
        &self.executor.requests
    }

    /// Let `side` take one step, then check the invariants.
    pub fn step(&mut self, side: Side) -> Result<Progress, String> {
        let progress = match side {
            Side::Driver => self.driver_step()?,
            Side::Executor => self.executor_step()?,
        };
        self.check_invariants()?;
        Ok(progress)
    }

    fn enter(&mut self, state: State) {
        self.state = state;
        self.history.push(state);
    }

    fn read_buffer(&self) -> String {
        self.buffer[..self.transfer_size].iter().collect()
    }

    fn driver_step(&mut self) -> Result<Progress, String> {
        match self.state {
            State::Idle => {
                if let Some(message) = self.driver.pending.pop_front() {
                    self.driver.outgoing = Some(Outgoing::new(&message));
                    self.driver_write()
                } else {
                    self.enter(State::Shutdown);
                    Ok(Progress::Moved)
                }
            }
            State::Await if self.driver.outgoing.is_some() => self.driver_write(),
            State::Await | State::RequestPartial | State::RequestFull => Ok(Progress::Waiting),
            state @ (State::ResponsePartial | State::ResponseFull) => {
                let fragment = self.read_buffer();
                let incoming = self
                    .driver
                    .incoming
                    .as_mut()
                    .ok_or_else(|| format!("driver saw {state:?} without awaiting a response"))?;
                incoming.push_str(&fragment);
                self.transfer_size = 0;

                if state == State::ResponseFull {
                    let response = self.driver.incoming.take().unwrap_or_default();
                    self.driver.responses.push(response);
                    self.enter(State::Idle);
                } else {
                    self.enter(State::Await);
                }
                Ok(Progress::Moved)
            }
            State::Shutdown => Ok(Progress::Done),
        }
    }

    fn driver_write(&mut self) -> Result<Progress, String> {
        let outgoing = self
            .driver
            .outgoing
            .as_mut()
            .ok_or("driver writing without a request")?;
        let (len, is_final) = outgoing.write_next(&mut self.buffer);
        self.transfer_size = len;
        if is_final {
            self.driver.outgoing = None;
            self.driver.incoming = Some(String::new());
        }
        self.enter(State::request(is_final));
        Ok(Progress::Moved)
    }

    fn executor_step(&mut self) -> Result<Progress, String> {
        match self.state {
            State::RequestPartial => {
                let fragment = self.read_buffer();
                self.executor.incoming.push_str(&fragment);
                self.transfer_size = 0;
                self.enter(State::Await);
                Ok(Progress::Moved)
            }
            State::RequestFull => {
                let fragment = self.read_buffer();
                self.executor.incoming.push_str(&fragment);
                let request = std::mem::take(&mut self.executor.incoming);
                self.executor.outgoing = Some(Outgoing::new(&respond(&request)));
                self.executor.requests.push(request);
                self.executor_write()
            }
            State::Await if self.executor.outgoing.is_some() => self.executor_write(),
            State::Idle | State::Await | State::ResponsePartial | State::ResponseFull => {
                Ok(Progress::Waiting)
            }
            State::Shutdown => {
                self.executor.stopped = true;
                Ok(Progress::Done)
            }
        }
    }

    fn executor_write(&mut self) -> Result<Progress, String> {
        let outgoing = self
            .executor
            .outgoing
            .as_mut()
            .ok_or("executor writing without a response")?;
        let (len, is_final) = outgoing.write_next(&mut self.buffer);
        self.transfer_size = len;
        if is_final {
            self.executor.outgoing = None;
        }
        self.enter(State::response(is_final));
        Ok(Progress::Moved)
    }

    fn check_invariants(&self) -> Result<(), String> {
        if self.transfer_size > self.buffer.len() {
            return Err(format!(
                "transfer size {} exceeds capacity {}",
                self.transfer_size,
                self.buffer.len()
            ));
        }

        if !self.state.carries_payload() && self.transfer_size != 0 {
            return Err(format!(
                "{:?} with transfer size {}",
                self.state, self.transfer_size
            ));
        }

        match self.state {
            State::Await => {
                let writers = [
                    self.driver.outgoing.is_some(),
                    self.executor.outgoing.is_some(),
                ];
                if writers.iter().filter(|w| **w).count() != 1 {
                    return Err(format!("Await with writers {writers:?}"));
                }
            }
            State::Idle => {
                if self.driver.outgoing.is_some()
                    || self.driver.incoming.is_some()
                    || self.executor.outgoing.is_some()
                    || !self.executor.incoming.is_empty()
                {
                    return Err("Idle with an exchange half done".to_string());
                }
            }
            _ => {}
        }

        if self.executor.stopped && self.state != State::Shutdown {
            return Err(format!("executor stopped in {:?}", self.state));
        }

        Ok(())
    }

    /// Alternate both sides until shutdown completes.
    pub fn run_to_completion(&mut self) -> Result<(), String> {
        loop {
            let driver = self.step(Side::Driver)?;
            let executor = self.step(Side::Executor)?;
            match (driver, executor) {
                (Progress::Done, Progress::Done) => return Ok(()),
                (Progress::Waiting, Progress::Waiting) => {
                    return Err(format!("deadlock in {:?}", self.state));
                }
                _ => {}
            }
        }
    }
}

/// Run `schedule`, finish the exchange, then check that every message
/// arrived intact and every response matches.
pub fn execute_and_verify(
    capacity: usize,
    messages: &[String],
    schedule: &[Side],
) -> Result<(), String> {
    let mut model = ChannelModel::new(capacity, messages.iter().cloned());

    for (i, side) in schedule.iter().enumerate() {
        model
            .step(*side)
            .map_err(|e| format!("step {i} ({side:?}): {e}"))?;
    }
    model.run_to_completion()?;

    if model.requests() != messages {
        return Err(format!(
            "executor received {:?}, driver sent {:?}",
            model.requests(),
            messages
        ));
    }

    let expected: Vec<String> = messages.iter().map(|m| respond(m)).collect();
    if model.responses() != expected.as_slice() {
        return Err(format!(
            "driver received {:?}, expected {:?}",
            model.responses(),
            expected
        ));
    }

    Ok(())
}
