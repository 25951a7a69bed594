//! Per-message handling for worker connections: asynchronous status
//! updates, the handshake, result streams, and the status HTTP surface.

use tracing::{debug, warn};

use taskmill_protocol::{
    ManagerMsg, ParseError, StatusTopic, WorkerMsg, MAX_STDOUT_STORAGE, PROTOCOL_VERSION,
};

use crate::clock::{now_usec, secs};
use crate::link::deadline_in;
use crate::manager::Manager;
use crate::task::{TaskResult, TaskState};
use crate::worker::{DisconnectReason, RemoteFileInfo, WorkerEntry, WorkerType};

/// What to do with a connection after one message was handled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MsgAction {
    Ok,
    /// A status query was answered; close the connection.
    DisconnectStatus,
    /// Protocol violation or I/O failure; tear the worker down.
    Failure,
    /// The worker announced it is idling out.
    IdleOut,
    /// The worker must be shut down (factory over its limit).
    ShutDown,
}

impl Manager {
    /// Deadline for a transfer of `length` bytes, from the configured
    /// transfer rate with the configured floor.
    pub(crate) fn transfer_deadline(&self, length: u64) -> tokio::time::Instant {
        let rate = self.config.default_transfer_rate.max(1);
        let secs = (length / rate + 1).max(self.config.min_transfer_timeout);
        deadline_in(secs)
    }

    /// Handle one message from a readable worker link. Returns false when
    /// the worker failed and was removed.
    pub(crate) async fn handle_worker(&mut self, id: crate::worker::WorkerId) -> bool {
        let Some(mut w) = self.workers.remove(&id) else {
            return true;
        };
        // Readiness indications can outlive the data that caused them;
        // only commit to a (deadline-bounded) read when bytes exist.
        if !w.link.has_buffered_line() {
            match w.link.try_fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.workers.insert(id, w);
                    return true;
                }
                Err(err) => {
                    debug!(worker = id, error = %err, "worker connection dropped");
                    self.stats.workers_lost += 1;
                    self.remove_worker_entry(w, DisconnectReason::Failure);
                    return false;
                }
            }
        }
        let deadline = deadline_in(self.config.short_timeout);
        let line = match w.link.read_line(deadline).await {
            Ok(line) => line,
            Err(err) => {
                debug!(worker = id, error = %err, "failed to read from worker");
                self.stats.workers_lost += 1;
                self.remove_worker_entry(w, DisconnectReason::Failure);
                return false;
            }
        };
        w.last_msg_recv_time = now_usec();
        debug!(worker = id, hostname = %w.hostname, rx = %line);

        let action = match WorkerMsg::parse(&line) {
            Ok(msg) => self.dispatch_msg(&mut w, msg).await,
            Err(ParseError::UnknownVerb(line)) => {
                debug!(worker = id, line = %line, "invalid message from worker");
                MsgAction::Failure
            }
            Err(err) => {
                debug!(worker = id, error = %err, "malformed message from worker");
                MsgAction::Failure
            }
        };
        self.apply_msg_action(w, action).await
    }

    pub(crate) async fn apply_msg_action(&mut self, w: WorkerEntry, action: MsgAction) -> bool {
        match action {
            MsgAction::Ok => {
                self.workers.insert(w.id, w);
                true
            }
            MsgAction::DisconnectStatus => {
                self.remove_worker_entry(w, DisconnectReason::StatusQuery);
                true
            }
            MsgAction::Failure => {
                self.stats.workers_lost += 1;
                self.remove_worker_entry(w, DisconnectReason::Failure);
                false
            }
            MsgAction::IdleOut => {
                self.stats.workers_idled_out += 1;
                self.remove_worker_entry(w, DisconnectReason::IdleOut);
                true
            }
            MsgAction::ShutDown => {
                let mut w = w;
                let deadline = deadline_in(self.config.short_timeout);
                let _ = w
                    .link
                    .send_line(&ManagerMsg::Exit.to_string(), deadline)
                    .await;
                self.stats.workers_released += 1;
                self.remove_worker_entry(w, DisconnectReason::Explicit);
                true
            }
        }
    }

    /// Handle one asynchronous message. The worker entry is detached from
    /// the table while its message is processed.
    pub(crate) async fn dispatch_msg(&mut self, w: &mut WorkerEntry, msg: WorkerMsg) -> MsgAction {
        if self.config.password.is_some() && !w.authenticated {
            return match msg {
                WorkerMsg::Auth { digest } => self.handle_auth(w, &digest).await,
                _ => MsgAction::Failure,
            };
        }
        match msg {
            WorkerMsg::Alive => MsgAction::Ok,
            WorkerMsg::Handshake {
                protocol,
                hostname,
                os,
                arch,
                version,
            } => {
                self.handle_handshake(w, protocol, hostname, os, arch, version)
                    .await
            }
            WorkerMsg::Auth { .. } => {
                debug!(worker = w.id, "unexpected auth from worker; no password is set");
                MsgAction::Failure
            }
            WorkerMsg::Name => {
                let deadline = deadline_in(self.config.short_timeout);
                let name = self.config.name.clone().unwrap_or_default();
                match w.link.send_line(&name, deadline).await {
                    Ok(()) => MsgAction::Ok,
                    Err(_) => MsgAction::Failure,
                }
            }
            WorkerMsg::Info { field, value } => self.handle_info(w, &field, &value),
            WorkerMsg::Resource {
                name,
                total,
                smallest,
                largest,
            } => {
                let r = crate::resources::Resource {
                    total,
                    inuse: 0,
                    smallest,
                    largest,
                };
                if let Some(coname) = name.strip_prefix("coprocess_") {
                    w.coprocess_resources.update_dimension(coname, r);
                } else {
                    w.resources.update_dimension(&name, r);
                }
                MsgAction::Ok
            }
            WorkerMsg::ResourceTag(tag) => {
                w.resources.tag = tag;
                MsgAction::Ok
            }
            WorkerMsg::Feature { name } => {
                debug!(worker = w.id, feature = %name, "feature reported");
                w.features.insert(name);
                MsgAction::Ok
            }
            WorkerMsg::CacheUpdate {
                cache_name,
                size,
                transfer_time,
                transfer_id,
            } => {
                let info = w
                    .files
                    .entry(cache_name.clone())
                    .or_insert_with(|| RemoteFileInfo::pending(size));
                info.size = size;
                info.transfer_time = transfer_time;
                info.in_cache = true;
                self.transfers.remove(&transfer_id);
                if let Some(log) = self.txn_log.as_mut() {
                    let extra = format!("{size} {transfer_time}");
                    log.write("CACHE", &cache_name, "RECEIVED", Some(&extra));
                }
                MsgAction::Ok
            }
            WorkerMsg::CacheInvalid {
                cache_name,
                length,
                transfer_id,
            } => {
                let deadline = deadline_in(self.config.long_timeout);
                let message = match w.link.read_exact_bytes(length, deadline).await {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(_) => return MsgAction::Failure,
                };
                debug!(
                    worker = w.id,
                    hostname = %w.hostname,
                    cache_name = %cache_name,
                    error = %message,
                    "worker invalidated a cache entry"
                );
                w.files.remove(&cache_name);
                if let Some(id) = transfer_id {
                    self.transfers.remove(&id);
                }
                MsgAction::Ok
            }
            WorkerMsg::TransferAddress { host, port } => {
                w.transfer_addr = Some((host, port));
                MsgAction::Ok
            }
            WorkerMsg::AvailableResults => {
                self.workers_with_available_results.insert(w.id);
                MsgAction::Ok
            }
            WorkerMsg::StatusQuery(topic) => {
                w.kind = WorkerType::Status;
                w.hostname = "STATUS".to_string();
                self.send_status_response(w, topic).await
            }
            WorkerMsg::HttpGet { path } => self.handle_http_request(w, &path).await,
            // Result traffic only belongs inside a send_results stream.
            WorkerMsg::TaskResult { .. }
            | WorkerMsg::Update { .. }
            | WorkerMsg::End
            | WorkerMsg::File { .. }
            | WorkerMsg::GetFailed { .. } => {
                debug!(worker = w.id, "result message outside a send_results stream");
                MsgAction::Failure
            }
        }
    }

    async fn handle_auth(&mut self, w: &mut WorkerEntry, digest: &str) -> MsgAction {
        let (Some(password), Some(nonce)) =
            (self.config.password.clone(), w.challenge_nonce.take())
        else {
            return MsgAction::Failure;
        };
        let expected = format!("{:x}", md5::compute(format!("{nonce}{password}")));
        if digest != expected {
            warn!(worker = w.id, addr = %w.addrport, "worker presented the wrong password");
            return MsgAction::Failure;
        }
        w.authenticated = true;
        let deadline = deadline_in(self.config.short_timeout);
        match w
            .link
            .send_line(&ManagerMsg::AuthOk.to_string(), deadline)
            .await
        {
            Ok(()) => MsgAction::Ok,
            Err(_) => MsgAction::Failure,
        }
    }

    async fn handle_handshake(
        &mut self,
        w: &mut WorkerEntry,
        protocol: u32,
        hostname: String,
        os: String,
        arch: String,
        version: String,
    ) -> MsgAction {
        if protocol != PROTOCOL_VERSION {
            warn!(
                addr = %w.addrport,
                worker_protocol = protocol,
                manager_protocol = PROTOCOL_VERSION,
                "rejecting worker with protocol mismatch"
            );
            self.stats.workers_blocked += 1;
            self.blocklist.block(&hostname, None);
            return MsgAction::Failure;
        }
        if self.blocklist.is_blocked(&hostname) {
            debug!(hostname = %hostname, "rejecting worker from blocked host");
            return MsgAction::Failure;
        }

        w.hostname = hostname;
        w.os = os;
        w.arch = arch;
        w.version = version;
        w.kind = WorkerType::Worker;
        self.stats.workers_joined += 1;
        debug!(
            hostname = %w.hostname,
            addr = %w.addrport,
            version = %w.version,
            os = %w.os,
            arch = %w.arch,
            "worker ready"
        );
        self.write_txn_worker(w, None);

        let local = self
            .listener
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| "0.0.0.0".to_string());
        let ack = ManagerMsg::Handshake {
            protocol: PROTOCOL_VERSION,
            addr: local,
            port: self.port,
        };
        let deadline = deadline_in(self.config.short_timeout);
        match w.link.send_line(&ack.to_string(), deadline).await {
            Ok(()) => MsgAction::Ok,
            Err(_) => MsgAction::Failure,
        }
    }

    fn handle_info(&mut self, w: &mut WorkerEntry, field: &str, value: &str) -> MsgAction {
        let int = |v: &str| v.parse::<i64>().unwrap_or(0);
        match field {
            "tasks_waiting" => w.reported.tasks_waiting = int(value),
            "tasks_running" => w.reported.tasks_running = int(value),
            "time_send" => w.reported.time_send = int(value).max(0) as u64,
            "time_receive" => w.reported.time_receive = int(value).max(0) as u64,
            "time_execute" => w.reported.time_execute = int(value).max(0) as u64,
            "bytes_sent" => w.reported.bytes_sent = int(value).max(0) as u64,
            "bytes_received" => w.reported.bytes_received = int(value).max(0) as u64,
            "idle-disconnecting" => return MsgAction::IdleOut,
            "end_of_resource_update" => {
                w.recount_resources();
                self.note_worker_capacity(w);
                if let Some(log) = self.txn_log.as_mut() {
                    let extra = format!(
                        "cores {} memory {} disk {} gpus {}",
                        w.resources.cores.total,
                        w.resources.memory.total,
                        w.resources.disk.total,
                        w.resources.gpus.total
                    );
                    log.write("WORKER", &w.addrport, "RESOURCES", Some(&extra));
                }
            }
            "worker-id" => {
                w.worker_uuid = Some(value.to_string());
                self.write_txn_worker(w, None);
            }
            "worker-end-time" => {
                w.end_time = Some(secs(int(value).max(0) as u64));
            }
            "from-factory" => {
                self.fetch_factory = true;
                w.factory_name = Some(value.to_string());
                let f = self.factories.lookup_or_create(value);
                f.connected_workers += 1;
                if f.connected_workers > f.max_workers {
                    return MsgAction::ShutDown;
                }
            }
            // Info fields are advisory; unknown ones are ignored.
            _ => {}
        }
        MsgAction::Ok
    }

    /// Track the largest per-dimension capacity across connected workers,
    /// for a worker entry currently detached from the table.
    pub(crate) fn note_worker_capacity(&mut self, w: &WorkerEntry) {
        if w.resources.workers.total < 1 {
            return;
        }
        self.current_max_worker
            .merge_max(&crate::resources::ResourceSummary {
                cores: w.resources.cores.largest,
                memory: w.resources.memory.largest,
                disk: w.resources.disk.largest,
                gpus: w.resources.gpus.largest,
            });
    }

    /// Ask one worker for all queued results and process the stream of
    /// `result`/`update` messages until `end`.
    pub(crate) async fn get_available_results(&mut self, id: crate::worker::WorkerId) {
        let Some(mut w) = self.workers.remove(&id) else {
            return;
        };
        let deadline = deadline_in(self.config.short_timeout);
        let req = ManagerMsg::SendResults { max: -1 };
        if w.link.send_line(&req.to_string(), deadline).await.is_err() {
            self.stats.workers_lost += 1;
            self.remove_worker_entry(w, DisconnectReason::Failure);
            return;
        }
        debug!(worker = id, hostname = %w.hostname, "reading results");

        loop {
            let deadline = deadline_in(self.config.short_timeout);
            let line = match w.link.read_line(deadline).await {
                Ok(line) => line,
                Err(_) => {
                    self.stats.workers_lost += 1;
                    self.remove_worker_entry(w, DisconnectReason::Failure);
                    return;
                }
            };
            w.last_msg_recv_time = now_usec();
            let msg = match WorkerMsg::parse(&line) {
                Ok(msg) => msg,
                Err(_) => {
                    debug!(worker = id, line = %line, "invalid response to send_results");
                    self.stats.workers_lost += 1;
                    self.remove_worker_entry(w, DisconnectReason::Failure);
                    return;
                }
            };
            match msg {
                WorkerMsg::End => break,
                WorkerMsg::TaskResult {
                    status,
                    exit,
                    output_len,
                    execute_time,
                    task_id,
                } => {
                    if self
                        .get_result(&mut w, status, exit, output_len, execute_time, task_id)
                        .await
                        .is_err()
                    {
                        self.stats.workers_lost += 1;
                        self.remove_worker_entry(w, DisconnectReason::Failure);
                        return;
                    }
                }
                WorkerMsg::Update {
                    task_id,
                    path,
                    offset,
                    length,
                } => {
                    if self
                        .get_update(&mut w, task_id, &path, offset, length)
                        .await
                        .is_err()
                    {
                        self.stats.workers_lost += 1;
                        self.remove_worker_entry(w, DisconnectReason::Failure);
                        return;
                    }
                }
                // Interleaved status updates are processed in place.
                other => {
                    if self.dispatch_msg(&mut w, other).await != MsgAction::Ok {
                        self.stats.workers_lost += 1;
                        self.remove_worker_entry(w, DisconnectReason::Failure);
                        return;
                    }
                }
            }
        }
        self.workers.insert(id, w);
    }

    /// Store one `result` message: stdout, codes, and timing. The task
    /// moves to waiting-retrieval (or straight back to ready when the
    /// worker forsook it). `Err` means the connection is broken.
    async fn get_result(
        &mut self,
        w: &mut WorkerEntry,
        status: i32,
        exit: i32,
        output_len: u64,
        execute_time: u64,
        task_id: u64,
    ) -> Result<(), ()> {
        let owned = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.worker == Some(w.id));
        if !owned {
            debug!(
                worker = w.id,
                task = task_id,
                "result for a task not assigned to this worker; ignoring"
            );
            let deadline = self.transfer_deadline(output_len);
            return w.link.soak(output_len, deadline).await.map_err(|_| ());
        }
        let Some(mut t) = self.tasks.remove(&task_id) else {
            return Ok(());
        };

        if status == TaskResult::Forsaken.code() {
            self.delete_uncacheable_inputs(w, &t).await;
            self.reap_task_from_worker(w, &mut t);
            t.forsaken_count += 1;
            // A forsaken attempt does not count against the retry budget.
            t.try_count = t.try_count.saturating_sub(1);
            self.change_task_state(&mut t, TaskState::Ready);
            self.tasks.insert(task_id, t);
            return Ok(());
        }

        let observed = now_usec().saturating_sub(t.time_when_commit_end);
        t.time_workers_execute_last = observed.min(execute_time);
        t.time_workers_execute_all += t.time_workers_execute_last;

        let retrieved_len = output_len.min(MAX_STDOUT_STORAGE);
        let deadline = self.transfer_deadline(retrieved_len);
        let mut output = match w.link.read_exact_bytes(retrieved_len, deadline).await {
            Ok(bytes) => bytes,
            Err(_) => return Err(()),
        };
        let mut result = TaskResult::from_code(status);
        if output_len > retrieved_len {
            warn!(
                task = task_id,
                output_len, "task stdout exceeds storage limit; truncating"
            );
            let deadline = self.transfer_deadline(output_len - retrieved_len);
            w.link
                .soak(output_len - retrieved_len, deadline)
                .await
                .map_err(|_| ())?;
            let marker = format!(
                "\n>>>>>> STDOUT TRUNCATED: {} OF {} BYTES DROPPED.\n",
                output_len - retrieved_len,
                output_len
            );
            output.extend_from_slice(marker.as_bytes());
            if result == TaskResult::Success {
                result = TaskResult::StdoutMissing;
            }
        }

        if let Some(limit) = self.config.bandwidth_limit {
            if limit > 0.0 {
                let pace = std::time::Duration::from_secs_f64(output_len as f64 / limit);
                tokio::time::sleep(pace).await;
            }
        }

        t.bytes_received += output_len;
        self.stats.bytes_received += output_len;
        t.output = Some(output);
        t.result = result;
        t.exit_code = exit;
        self.stats.time_workers_execute += t.time_workers_execute_last;
        w.finished_tasks += 1;

        self.change_task_state(&mut t, TaskState::WaitingRetrieval);
        self.tasks.insert(task_id, t);
        Ok(())
    }

    /// Apply one watched-output update. Stale updates (cancelled task,
    /// unwatched file) are soaked so the stream stays aligned.
    async fn get_update(
        &mut self,
        w: &mut WorkerEntry,
        task_id: u64,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<(), ()> {
        let deadline = self.transfer_deadline(length);
        let local = self
            .tasks
            .get(&task_id)
            .filter(|t| t.worker == Some(w.id))
            .and_then(|t| {
                t.outputs
                    .iter()
                    .find(|f| f.is_watched() && f.remote_name == path)
                    .and_then(|f| f.path.clone())
            });
        let Some(local) = local else {
            debug!(
                worker = w.id,
                task = task_id,
                path,
                "update for an unknown or unwatched file; discarding"
            );
            return w.link.soak(length, deadline).await.map_err(|_| ());
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&local)
            .await;
        match file {
            Ok(mut file) => {
                w.link
                    .read_to_file(&mut file, offset, length, deadline)
                    .await
                    .map_err(|_| ())?;
                let _ = file.set_len(offset + length).await;
                Ok(())
            }
            Err(err) => {
                debug!(path = %local.display(), error = %err, "cannot update watched file");
                w.link.soak(length, deadline).await.map_err(|_| ())
            }
        }
    }

    async fn send_status_response(&mut self, w: &mut WorkerEntry, topic: StatusTopic) -> MsgAction {
        let payload = self.status_value(topic);
        let deadline = deadline_in(self.config.short_timeout);
        match w.link.send_line(&payload.to_string(), deadline).await {
            Ok(()) => MsgAction::DisconnectStatus,
            Err(_) => MsgAction::Failure,
        }
    }

    /// Serve an HTTP GET that arrived on the worker port: an HTML index at
    /// `/`, raw JSON for the status topics.
    async fn handle_http_request(&mut self, w: &mut WorkerEntry, path: &str) -> MsgAction {
        // Swallow the request headers.
        loop {
            let deadline = deadline_in(self.config.short_timeout);
            match w.link.read_line(deadline).await {
                Ok(line) if line.is_empty() => break,
                Ok(_) => continue,
                Err(_) => return MsgAction::Failure,
            }
        }
        w.kind = WorkerType::Status;

        let deadline = deadline_in(self.config.short_timeout);
        let response = if path == "/" {
            let body = "<h1>taskmill manager</h1>\n<ul>\n\
                 <li> <a href=\"/queue_status\">Queue Status</a>\n\
                 <li> <a href=\"/task_status\">Task Status</a>\n\
                 <li> <a href=\"/worker_status\">Worker Status</a>\n\
                 <li> <a href=\"/resources_status\">Resources Status</a>\n\
                 </ul>\n";
            format!(
                "HTTP/1.1 200 OK\nConnection: close\nContent-type: text/html\n\n{body}"
            )
        } else {
            match StatusTopic::from_request(path.trim_start_matches('/')) {
                Some(topic) => {
                    let payload = self.status_value(topic);
                    format!(
                        "HTTP/1.1 200 OK\nConnection: close\n\
                         Access-Control-Allow-Origin: *\nContent-type: text/plain\n\n{payload}"
                    )
                }
                None => "HTTP/1.1 404 Not Found\nConnection: close\n\n".to_string(),
            }
        };
        match w.link.send_bytes(response.as_bytes(), deadline).await {
            Ok(()) => MsgAction::DisconnectStatus,
            Err(_) => MsgAction::Failure,
        }
    }
}
