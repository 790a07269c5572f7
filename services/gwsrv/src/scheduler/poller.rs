//! Per-gateway poller

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ems_modbus::constants::EXCEPTION_FLAG;
use ems_modbus::{Adu, ProtocolError, Request, Response};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::transaction::TransactionTable;
use super::{PollSettings, Submission};
use crate::connection::{ConnectionState, GatewayLink};
use crate::error::{GwError, Result};
use crate::health::HealthRegistry;
use crate::registry::Gateway;
use crate::sink::{PollResult, ResultSink};

/// Where a request came from, and where its outcome goes
enum Origin {
    /// Index into the gateway's poll groups
    Poll(usize),
    Submit(oneshot::Sender<Result<Response>>),
}

struct Job {
    request: Request,
    origin: Origin,
}

struct InFlight {
    slave_id: u8,
    job: Job,
    issued_at: DateTime<Utc>,
    started: Instant,
}

/// Work for one slave; at most one request on the wire
#[derive(Default)]
struct SlaveQueue {
    queue: VecDeque<Job>,
    in_flight: Option<u16>,
    /// Groups queued or in flight, so ticks never stack duplicates
    pending_groups: HashSet<usize>,
}

pub(super) struct Poller {
    gateway: Arc<Gateway>,
    link: GatewayLink,
    state: tokio::sync::watch::Receiver<ConnectionState>,
    submissions: mpsc::Receiver<Submission>,
    table: TransactionTable<InFlight>,
    slaves: BTreeMap<u8, SlaveQueue>,
    interval: Duration,
    request_timeout: Duration,
    sink: Arc<dyn ResultSink>,
    health: HealthRegistry,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        gateway: Arc<Gateway>,
        link: GatewayLink,
        submissions: mpsc::Receiver<Submission>,
        settings: &PollSettings,
        sink: Arc<dyn ResultSink>,
        health: HealthRegistry,
        cancel: CancellationToken,
    ) -> Self {
        let slaves = gateway
            .slave_ids
            .iter()
            .map(|&id| (id, SlaveQueue::default()))
            .collect();
        let state = link.handle.subscribe();

        Self {
            interval: gateway.interval.unwrap_or(settings.interval),
            request_timeout: settings.request_timeout,
            gateway,
            link,
            state,
            submissions,
            table: TransactionTable::new(),
            slaves,
            sink,
            health,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(
            "{} poller: {} slaves, {} groups, every {:?}",
            self.gateway.id,
            self.slaves.len(),
            self.gateway.groups.len(),
            self.interval
        );

        loop {
            let deadline = self.table.next_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                changed = self.state.changed() => {
                    if changed.is_err() {
                        debug!("{} connection worker gone", self.gateway.id);
                        break;
                    }
                    let state = *self.state.borrow_and_update();
                    if state != ConnectionState::Connected {
                        self.fail_outstanding(state).await;
                    }
                },

                frame = self.link.inbound.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => break,
                },

                _ = sleep_until(deadline) => self.expire_due().await,

                Some(submission) = self.submissions.recv() => {
                    self.on_submission(submission).await;
                },

                _ = ticker.tick() => self.on_tick(),
            }

            self.dispatch().await;
        }

        debug!(
            "{} poller stopped, {} requests abandoned",
            self.gateway.id,
            self.table.len()
        );
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Queue every poll group for every slave, skipping groups still pending
    fn on_tick(&mut self) {
        if !self.is_connected() {
            trace!("{} tick skipped, not connected", self.gateway.id);
            return;
        }

        for (&slave_id, slave) in self.slaves.iter_mut() {
            for (index, group) in self.gateway.groups.iter().enumerate() {
                if slave.pending_groups.insert(index) {
                    slave.queue.push_back(Job {
                        request: group.request.clone(),
                        origin: Origin::Poll(index),
                    });
                } else {
                    debug!(
                        "{} slave {} still busy with '{}', poll skipped",
                        self.gateway.id, slave_id, group.name
                    );
                    self.health.record_skipped(self.gateway.id, slave_id);
                }
            }
        }
    }

    async fn on_submission(&mut self, submission: Submission) {
        let Submission {
            slave_id,
            request,
            reply,
        } = submission;
        let job = Job {
            request,
            origin: Origin::Submit(reply),
        };

        if !self.is_connected() {
            self.finish(slave_id, job, None, Err(GwError::not_connected()))
                .await;
            return;
        }
        match self.slaves.get_mut(&slave_id) {
            // Ahead of queued polls
            Some(slave) => slave.queue.push_front(job),
            None => {
                let err = GwError::config(format!(
                    "Slave {} is not configured behind {}",
                    slave_id, self.gateway.id
                ));
                self.finish(slave_id, job, None, Err(err)).await;
            },
        }
    }

    /// Put the next queued job of every idle slave on the wire
    async fn dispatch(&mut self) {
        if !self.is_connected() {
            return;
        }

        let idle: Vec<u8> = self
            .slaves
            .iter()
            .filter(|(_, s)| s.in_flight.is_none() && !s.queue.is_empty())
            .map(|(&id, _)| id)
            .collect();

        for slave_id in idle {
            let Some(job) = self
                .slaves
                .get_mut(&slave_id)
                .and_then(|s| s.queue.pop_front())
            else {
                continue;
            };

            let pdu = match job.request.to_pdu() {
                Ok(pdu) => pdu,
                Err(e) => {
                    self.finish(slave_id, job, None, Err(e.into())).await;
                    continue;
                },
            };

            let started = Instant::now();
            let in_flight = InFlight {
                slave_id,
                job,
                issued_at: Utc::now(),
                started,
            };
            let Some(tid) = self.table.begin(started + self.request_timeout, in_flight) else {
                warn!("{} transaction ids exhausted", self.gateway.id);
                break;
            };

            // Must not block: the worker may be parked on a full inbound queue
            let frame = Adu::new(tid, slave_id, pdu).to_bytes();
            match self.link.handle.try_send(frame) {
                Ok(true) => {
                    if let Some(slave) = self.slaves.get_mut(&slave_id) {
                        slave.in_flight = Some(tid);
                    }
                },
                Ok(false) => {
                    trace!(
                        "{} outbound queue full, slave {} retried on next event",
                        self.gateway.id,
                        slave_id
                    );
                    if let Some(in_flight) = self.table.complete(tid) {
                        if let Some(slave) = self.slaves.get_mut(&slave_id) {
                            slave.queue.push_front(in_flight.job);
                        }
                    }
                    break;
                },
                Err(e) => {
                    if let Some(in_flight) = self.table.complete(tid) {
                        self.complete(in_flight, Err(e)).await;
                    }
                },
            }
        }
    }

    async fn on_frame(&mut self, frame: Bytes) {
        let adu = match Adu::decode(&frame) {
            Ok(adu) => adu,
            Err(e) => {
                warn!("{} dropped malformed frame: {}", self.gateway.id, e);
                self.health.record_rejected_frame(self.gateway.id);
                return;
            },
        };

        let tid = adu.transaction_id;
        let Some(pending) = self.table.get(tid) else {
            warn!(
                "{} response with unknown transaction id {:04X} from unit {} dropped",
                self.gateway.id, tid, adu.unit_id
            );
            self.health.record_unmatched(self.gateway.id);
            return;
        };

        // A mismatched frame leaves the request waiting for its real answer
        let expected_fc = pending.job.request.function_code();
        let check = adu.expect_unit(pending.slave_id).and_then(|()| {
            let actual = adu.pdu.function_code().unwrap_or(0);
            if actual & !EXCEPTION_FLAG == expected_fc {
                Ok(())
            } else {
                Err(ProtocolError::FunctionMismatch {
                    expected: expected_fc,
                    actual,
                })
            }
        });
        if let Err(e) = check {
            warn!(
                "{} transaction {:04X} response rejected: {}",
                self.gateway.id, tid, e
            );
            self.health.record_rejected_frame(self.gateway.id);
            return;
        }

        let Some(in_flight) = self.table.complete(tid) else {
            return;
        };
        let outcome = in_flight
            .job
            .request
            .parse_response(&adu.pdu)
            .map_err(GwError::from);
        trace!(
            "{} transaction {:04X} done in {:?}",
            self.gateway.id,
            tid,
            in_flight.started.elapsed()
        );
        self.complete(in_flight, outcome).await;
    }

    async fn expire_due(&mut self) {
        for (tid, in_flight) in self.table.expire(Instant::now()) {
            debug!(
                "{} slave {} transaction {:04X} timed out",
                self.gateway.id, in_flight.slave_id, tid
            );
            let err = GwError::timeout(format!(
                "slave {} did not answer FC{:02X} within {:?}",
                in_flight.slave_id,
                in_flight.job.request.function_code(),
                self.request_timeout
            ));
            self.complete(in_flight, Err(err)).await;
        }
    }

    /// Connection left `Connected`: everything queued or in flight fails
    async fn fail_outstanding(&mut self, state: ConnectionState) {
        let in_flight = self.table.drain();
        let mut queued = Vec::new();
        for (&slave_id, slave) in self.slaves.iter_mut() {
            slave.in_flight = None;
            slave.pending_groups.clear();
            queued.extend(slave.queue.drain(..).map(|job| (slave_id, job)));
        }

        if !in_flight.is_empty() || !queued.is_empty() {
            debug!(
                "{} {}: failing {} in-flight and {} queued requests",
                self.gateway.id,
                state,
                in_flight.len(),
                queued.len()
            );
        }

        for (_, request) in in_flight {
            let err = GwError::connection(format!("{} {}", self.gateway.id, state));
            self.complete(request, Err(err)).await;
        }
        for (slave_id, job) in queued {
            let err = GwError::connection(format!("{} {}", self.gateway.id, state));
            self.finish(slave_id, job, None, Err(err)).await;
        }
    }

    async fn complete(&mut self, in_flight: InFlight, outcome: Result<Response>) {
        if let Some(slave) = self.slaves.get_mut(&in_flight.slave_id) {
            slave.in_flight = None;
        }
        let timing = Some((in_flight.issued_at, in_flight.started.elapsed()));
        self.finish(in_flight.slave_id, in_flight.job, timing, outcome)
            .await;
    }

    /// Deliver an outcome to health, the sink and a waiting submitter
    async fn finish(
        &mut self,
        slave_id: u8,
        job: Job,
        timing: Option<(DateTime<Utc>, Duration)>,
        outcome: Result<Response>,
    ) {
        let group = match &job.origin {
            Origin::Poll(index) => {
                if let Some(slave) = self.slaves.get_mut(&slave_id) {
                    slave.pending_groups.remove(index);
                }
                self.gateway.groups.get(*index).map(|g| g.name.clone())
            },
            Origin::Submit(_) => None,
        };

        self.health
            .record_outcome(self.gateway.id, slave_id, &outcome);

        if let Origin::Submit(reply) = job.origin {
            // Submitter may have given up waiting
            let _ = reply.send(outcome.clone());
        }

        let (issued_at, latency) = timing.unwrap_or_else(|| (Utc::now(), Duration::ZERO));
        self.sink
            .deliver(PollResult {
                gateway: self.gateway.id,
                slave_id,
                group,
                request: job.request,
                outcome,
                issued_at,
                latency,
            })
            .await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
