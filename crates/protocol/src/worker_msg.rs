use crate::{url_decode, ParseError};

/// A status topic a client may ask the manager for.
///
/// The manager answers with a JSON payload and closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTopic {
    /// The whole-queue summary record.
    Queue,
    /// One record per known task.
    Tasks,
    /// One record per connected worker.
    Workers,
    /// Aggregated resource totals (same payload as [`StatusTopic::Queue`]).
    Resources,
    /// One record per task category.
    Categories,
}

impl StatusTopic {
    /// Map a request path or status verb to a topic, accepting both the
    /// wire verbs (`queue_status`, ...) and the short HTTP aliases.
    pub fn from_request(request: &str) -> Option<StatusTopic> {
        match request {
            "queue_status" | "queue" => Some(StatusTopic::Queue),
            "task_status" | "tasks" => Some(StatusTopic::Tasks),
            "worker_status" | "workers" => Some(StatusTopic::Workers),
            "resources_status" | "resources" => Some(StatusTopic::Resources),
            "wable_status" | "categories" => Some(StatusTopic::Categories),
            _ => None,
        }
    }
}

/// A message sent by a worker (or a status client) to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMsg {
    /// Initial handshake reporting identity and platform.
    ///
    /// On the wire: `taskvine <protocol> <hostname> <os> <arch> <version>`
    Handshake {
        /// Protocol revision the worker speaks.
        protocol: u32,
        /// Worker hostname.
        hostname: String,
        /// Operating system name.
        os: String,
        /// Hardware architecture.
        arch: String,
        /// Worker software version.
        version: String,
    },
    /// Keepalive response; refreshes the last-message clock and nothing else.
    ///
    /// On the wire: `alive`
    Alive,
    /// A named metric or control field.
    ///
    /// On the wire: `info <field> <value...>`
    Info {
        /// Field name (e.g. `tasks_running`, `from-factory`).
        field: String,
        /// Raw value text; interpretation depends on the field.
        value: String,
    },
    /// One resource dimension report. `inuse` is never reported; the
    /// manager recomputes it from its own allocation envelopes.
    ///
    /// On the wire: `resource <name> <total> <smallest> <largest>`
    Resource {
        /// Dimension name: `cores`, `memory`, `disk`, `gpus` or `workers`.
        name: String,
        /// Total units available.
        total: i64,
        /// Smallest single allocation observed.
        smallest: i64,
        /// Largest single allocation observed.
        largest: i64,
    },
    /// Marker that a batch of resource lines is complete.
    ///
    /// On the wire: `resource tag <value>`
    ResourceTag(i64),
    /// A user-declared worker feature.
    ///
    /// On the wire: `feature <url-encoded-name>`
    Feature {
        /// Decoded feature name.
        name: String,
    },
    /// A requested transfer or command succeeded and the named entry is now
    /// present in the worker cache.
    ///
    /// On the wire: `cache-update <cache-name> <size> <transfer-time-usec> <transfer-id>`
    CacheUpdate {
        /// Content-addressed cache entry name.
        cache_name: String,
        /// Entry size in bytes.
        size: i64,
        /// Time the transfer took, in microseconds.
        transfer_time: u64,
        /// Transfer id assigned at dispatch, or `X` when none applies.
        transfer_id: String,
    },
    /// A requested transfer failed; `length` bytes of error text follow.
    ///
    /// On the wire: `cache-invalid <cache-name> <length> [transfer-id]`
    CacheInvalid {
        /// Content-addressed cache entry name.
        cache_name: String,
        /// Length of the error text that follows the line.
        length: u64,
        /// Transfer id assigned at dispatch, when the failure maps to one.
        transfer_id: Option<String>,
    },
    /// The worker listens for peer transfers at this address.
    ///
    /// On the wire: `transfer-address <host> <port>`
    TransferAddress {
        /// Address peers should connect to.
        host: String,
        /// Port of the worker transfer server.
        port: u16,
    },
    /// Completed results are queued on the worker; the manager should issue
    /// `send_results` when convenient.
    ///
    /// On the wire: `available_results`
    AvailableResults,
    /// One completed task. `output_len` bytes of stdout follow the line.
    ///
    /// On the wire: `result <status> <exit> <output-len> <execute-usec> <taskid>`
    TaskResult {
        /// Numeric task result code.
        status: i32,
        /// Process exit code or terminating signal.
        exit: i32,
        /// Length of the stdout payload that follows.
        output_len: u64,
        /// Wall execution time in microseconds, as measured by the worker.
        execute_time: u64,
        /// Task id this result belongs to.
        task_id: u64,
    },
    /// Partial content of a watched output file; `length` bytes follow.
    ///
    /// On the wire: `update <taskid> <remote-path> <offset> <length>`
    Update {
        /// Task id the watched file belongs to.
        task_id: u64,
        /// Path of the file inside the task sandbox.
        path: String,
        /// Byte offset the payload starts at.
        offset: u64,
        /// Length of the payload that follows.
        length: u64,
    },
    /// Terminates a `send_results` reply stream.
    ///
    /// On the wire: `end`
    End,
    /// Successful reply to a `get`; `size` bytes of file content follow.
    ///
    /// On the wire: `file <cache-name> <size>`
    File {
        /// Cache entry being returned.
        cache_name: String,
        /// Length of the content that follows.
        size: u64,
    },
    /// Failed reply to a `get`.
    ///
    /// On the wire: `error <cache-name> <code>`
    GetFailed {
        /// Cache entry that could not be returned.
        cache_name: String,
        /// Errno-style failure code.
        code: i32,
    },
    /// Request for the manager's project name; answered with a bare line.
    ///
    /// On the wire: `name`
    Name,
    /// Response to a password challenge.
    ///
    /// On the wire: `auth <digest>`
    Auth {
        /// Hex digest of nonce and shared secret.
        digest: String,
    },
    /// A plain status query; the manager responds and disconnects.
    ///
    /// On the wire: `queue_status` | `task_status` | `worker_status` |
    /// `resources_status` | `wable_status`
    StatusQuery(StatusTopic),
    /// An HTTP request from a browser that connected to the worker port.
    ///
    /// On the wire: `GET <path> HTTP/<maj>.<min>`
    HttpGet {
        /// Requested path.
        path: String,
    },
}

fn field_err(verb: &'static str, line: &str) -> ParseError {
    ParseError::malformed(verb, line)
}

impl WorkerMsg {
    /// Parse one received line. Unknown verbs are an error; within the
    /// manager protocol they indicate a worker failure.
    pub fn parse(line: &str) -> Result<WorkerMsg, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split_ascii_whitespace();
        let verb = parts.next().unwrap_or("");

        match verb {
            "taskvine" => {
                let mut next = || parts.next().ok_or_else(|| field_err("taskvine", line));
                let protocol = next()?
                    .parse()
                    .map_err(|_| field_err("taskvine", line))?;
                Ok(WorkerMsg::Handshake {
                    protocol,
                    hostname: next()?.to_string(),
                    os: next()?.to_string(),
                    arch: next()?.to_string(),
                    version: next()?.to_string(),
                })
            }
            "alive" => Ok(WorkerMsg::Alive),
            "info" => {
                let field = parts.next().ok_or_else(|| field_err("info", line))?;
                let value = line
                    .splitn(3, ' ')
                    .nth(2)
                    .ok_or_else(|| field_err("info", line))?;
                Ok(WorkerMsg::Info {
                    field: field.to_string(),
                    value: value.to_string(),
                })
            }
            "resource" => {
                let name = parts.next().ok_or_else(|| field_err("resource", line))?;
                let rest: Vec<&str> = parts.collect();
                if name == "tag" && rest.len() == 1 {
                    let tag = rest[0].parse().map_err(|_| field_err("resource", line))?;
                    return Ok(WorkerMsg::ResourceTag(tag));
                }
                if rest.len() != 3 {
                    return Err(field_err("resource", line));
                }
                let scan =
                    |s: &str| s.parse::<i64>().map_err(|_| field_err("resource", line));
                Ok(WorkerMsg::Resource {
                    name: name.to_string(),
                    total: scan(rest[0])?,
                    smallest: scan(rest[1])?,
                    largest: scan(rest[2])?,
                })
            }
            "feature" => {
                let name = parts.next().ok_or_else(|| field_err("feature", line))?;
                Ok(WorkerMsg::Feature {
                    name: url_decode(name),
                })
            }
            "cache-update" => {
                let mut next = || parts.next().ok_or_else(|| field_err("cache-update", line));
                let cache_name = next()?.to_string();
                let size = next()?
                    .parse()
                    .map_err(|_| field_err("cache-update", line))?;
                let transfer_time = next()?
                    .parse()
                    .map_err(|_| field_err("cache-update", line))?;
                let transfer_id = next()?.to_string();
                Ok(WorkerMsg::CacheUpdate {
                    cache_name,
                    size,
                    transfer_time,
                    transfer_id,
                })
            }
            "cache-invalid" => {
                let cache_name = parts
                    .next()
                    .ok_or_else(|| field_err("cache-invalid", line))?
                    .to_string();
                let length = parts
                    .next()
                    .ok_or_else(|| field_err("cache-invalid", line))?
                    .parse()
                    .map_err(|_| field_err("cache-invalid", line))?;
                let transfer_id = parts.next().map(str::to_string);
                Ok(WorkerMsg::CacheInvalid {
                    cache_name,
                    length,
                    transfer_id,
                })
            }
            "transfer-address" => {
                let host = parts
                    .next()
                    .ok_or_else(|| field_err("transfer-address", line))?
                    .to_string();
                let port = parts
                    .next()
                    .ok_or_else(|| field_err("transfer-address", line))?
                    .parse()
                    .map_err(|_| field_err("transfer-address", line))?;
                Ok(WorkerMsg::TransferAddress { host, port })
            }
            "available_results" => Ok(WorkerMsg::AvailableResults),
            "result" => {
                let mut scan = || {
                    parts
                        .next()
                        .ok_or_else(|| field_err("result", line))
                        .map(str::to_string)
                };
                let status = scan()?.parse().map_err(|_| field_err("result", line))?;
                let exit = scan()?.parse().map_err(|_| field_err("result", line))?;
                let output_len = scan()?.parse().map_err(|_| field_err("result", line))?;
                let execute_time = scan()?.parse().map_err(|_| field_err("result", line))?;
                let task_id = scan()?.parse().map_err(|_| field_err("result", line))?;
                Ok(WorkerMsg::TaskResult {
                    status,
                    exit,
                    output_len,
                    execute_time,
                    task_id,
                })
            }
            "update" => {
                let mut next = || parts.next().ok_or_else(|| field_err("update", line));
                let task_id = next()?.parse().map_err(|_| field_err("update", line))?;
                let path = url_decode(next()?);
                let offset = next()?.parse().map_err(|_| field_err("update", line))?;
                let length = next()?.parse().map_err(|_| field_err("update", line))?;
                Ok(WorkerMsg::Update {
                    task_id,
                    path,
                    offset,
                    length,
                })
            }
            "end" => Ok(WorkerMsg::End),
            "file" => {
                let cache_name = parts
                    .next()
                    .ok_or_else(|| field_err("file", line))?
                    .to_string();
                let size = parts
                    .next()
                    .ok_or_else(|| field_err("file", line))?
                    .parse()
                    .map_err(|_| field_err("file", line))?;
                Ok(WorkerMsg::File { cache_name, size })
            }
            "error" => {
                let cache_name = parts
                    .next()
                    .ok_or_else(|| field_err("error", line))?
                    .to_string();
                let code = parts
                    .next()
                    .ok_or_else(|| field_err("error", line))?
                    .parse()
                    .map_err(|_| field_err("error", line))?;
                Ok(WorkerMsg::GetFailed { cache_name, code })
            }
            "name" => Ok(WorkerMsg::Name),
            "auth" => {
                let digest = parts
                    .next()
                    .ok_or_else(|| field_err("auth", line))?
                    .to_string();
                Ok(WorkerMsg::Auth { digest })
            }
            "GET" => {
                let path = parts.next().ok_or_else(|| field_err("GET", line))?;
                Ok(WorkerMsg::HttpGet {
                    path: path.to_string(),
                })
            }
            other => match StatusTopic::from_request(other) {
                Some(topic) => Ok(WorkerMsg::StatusQuery(topic)),
                None => Err(ParseError::UnknownVerb(line.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let msg = WorkerMsg::parse("taskvine 11 node17 linux x86_64 9.1.0").unwrap();
        assert_eq!(
            msg,
            WorkerMsg::Handshake {
                protocol: 11,
                hostname: "node17".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                version: "9.1.0".into(),
            }
        );
    }

    #[test]
    fn handshake_missing_field_is_malformed() {
        assert!(WorkerMsg::parse("taskvine 11 node17 linux x86_64").is_err());
    }

    #[test]
    fn info_value_keeps_spaces() {
        let msg = WorkerMsg::parse("info from-factory my factory name").unwrap();
        assert_eq!(
            msg,
            WorkerMsg::Info {
                field: "from-factory".into(),
                value: "my factory name".into(),
            }
        );
    }

    #[test]
    fn resource_line() {
        let msg = WorkerMsg::parse("resource cores 16 1 16").unwrap();
        assert_eq!(
            msg,
            WorkerMsg::Resource {
                name: "cores".into(),
                total: 16,
                smallest: 1,
                largest: 16,
            }
        );
        assert_eq!(
            WorkerMsg::parse("resource tag 42").unwrap(),
            WorkerMsg::ResourceTag(42)
        );
    }

    #[test]
    fn cache_update() {
        assert!(WorkerMsg::parse("cache-update file-md5-0011 1048576").is_err());
        let msg = WorkerMsg::parse("cache-update file-md5-0011 1048576 2500 abcd-ef").unwrap();
        assert_eq!(
            msg,
            WorkerMsg::CacheUpdate {
                cache_name: "file-md5-0011".into(),
                size: 1048576,
                transfer_time: 2500,
                transfer_id: "abcd-ef".into(),
            }
        );
    }

    #[test]
    fn cache_invalid_with_and_without_id() {
        assert_eq!(
            WorkerMsg::parse("cache-invalid f 17 uuid-1").unwrap(),
            WorkerMsg::CacheInvalid {
                cache_name: "f".into(),
                length: 17,
                transfer_id: Some("uuid-1".into()),
            }
        );
        assert_eq!(
            WorkerMsg::parse("cache-invalid f 17").unwrap(),
            WorkerMsg::CacheInvalid {
                cache_name: "f".into(),
                length: 17,
                transfer_id: None,
            }
        );
    }

    #[test]
    fn result_line() {
        let msg = WorkerMsg::parse("result 0 0 6 12345 1").unwrap();
        assert_eq!(
            msg,
            WorkerMsg::TaskResult {
                status: 0,
                exit: 0,
                output_len: 6,
                execute_time: 12345,
                task_id: 1,
            }
        );
    }

    #[test]
    fn status_queries() {
        assert_eq!(
            WorkerMsg::parse("queue_status").unwrap(),
            WorkerMsg::StatusQuery(StatusTopic::Queue)
        );
        assert_eq!(
            WorkerMsg::parse("wable_status").unwrap(),
            WorkerMsg::StatusQuery(StatusTopic::Categories)
        );
    }

    #[test]
    fn http_get() {
        assert_eq!(
            WorkerMsg::parse("GET /worker_status HTTP/1.1").unwrap(),
            WorkerMsg::HttpGet {
                path: "/worker_status".into()
            }
        );
    }

    #[test]
    fn unknown_verb_is_an_error() {
        assert!(matches!(
            WorkerMsg::parse("frobnicate 1 2 3"),
            Err(ParseError::UnknownVerb(_))
        ));
    }
}
