use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use rvpf_core::config::{ApplicationConfig, LinkConfig};
use rvpf_core::DateTime;

use crate::app::{FunctionCode, InternalIndications, ObjectItem};
use crate::channel::{ChannelReader, ChannelWriter};
use crate::connection::Connection;
use crate::endpoint::{Association, EndPointOptions, RemoteEndPoint};
use crate::objects::{ObjectInstance, Range, CROB_LATCH_ON, FLAG_ONLINE, FLAG_STATE};

/// Current values served by an outstation, one map per point type.
#[derive(Debug, Default)]
pub struct OutstationDatabase {
    pub binary_inputs: BTreeMap<u16, bool>,
    pub binary_outputs: BTreeMap<u16, bool>,
    pub analog_inputs: BTreeMap<u16, i32>,
    pub analog_outputs: BTreeMap<u16, f64>,
    pub counters: BTreeMap<u16, u32>,
}

impl OutstationDatabase {
    pub fn new() -> OutstationDatabase {
        OutstationDatabase::default()
    }
}

/// A TCP-listening outstation answering link management, reads, and
/// controls from an in-memory database. Associations are created on
/// demand for every master address that talks to us.
pub struct Dnp3Outstation {
    listener: TcpListener,
    local_addr: u16,
    link: LinkConfig,
    application: ApplicationConfig,
    database: Arc<Mutex<OutstationDatabase>>,
}

impl Dnp3Outstation {
    pub async fn bind(
        bind_addr: &str,
        local_addr: u16,
        application: ApplicationConfig,
    ) -> std::io::Result<Dnp3Outstation> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Dnp3Outstation {
            listener,
            local_addr,
            link: LinkConfig::default(),
            application,
            database: Arc::new(Mutex::new(OutstationDatabase::new())),
        })
    }

    pub fn listen_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn database(&self) -> Arc<Mutex<OutstationDatabase>> {
        self.database.clone()
    }

    /// Accept connections until the task is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut connections: Vec<Connection> = Vec::new();
            loop {
                let (stream, peer) = match self.listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("outstation accept failed: {e}");
                        continue;
                    }
                };
                info!("outstation: connection from {peer}");
                let _ = stream.set_nodelay(true);
                let (read, write) = stream.into_split();

                let slot: Arc<OnceLock<Arc<RemoteEndPoint>>> = Arc::new(OnceLock::new());
                let dispatch_slot = slot.clone();
                let connection = Connection::start(
                    ChannelReader::Tcp(read),
                    ChannelWriter::Tcp(write),
                    Arc::new(move |frame| {
                        if let Some(endpoint) = dispatch_slot.get() {
                            endpoint.dispatch(frame);
                        }
                    }),
                );
                let endpoint = RemoteEndPoint::new(
                    0,
                    connection.sender(),
                    EndPointOptions {
                        link: self.link.clone(),
                        application: self.application.clone(),
                        confirmed_user_data: false,
                        master: false,
                        auto_create: true,
                        expected_local: Some(self.local_addr),
                    },
                );
                let database = self.database.clone();
                endpoint.set_association_hook(Box::new(move |association| {
                    let database = database.clone();
                    tokio::spawn(async move {
                        serve_association(association, database).await;
                    });
                }));
                let _ = slot.set(endpoint);
                connections.retain(|connection| !connection.is_closed());
                connections.push(connection);
            }
        })
    }
}

async fn serve_association(
    association: Arc<Association>,
    database: Arc<Mutex<OutstationDatabase>>,
) {
    debug!("outstation: association {:?} created", association.key);
    while let Some(request) = association.recv_request().await {
        let seq = request.control.seq;
        let (items, iin) = match request.function {
            FunctionCode::Read => build_read_response(&database, &request.items),
            FunctionCode::Select => {
                // Select arms without operating: echo the objects back.
                (mirror_controls(&database, &request.items, false), InternalIndications::default())
            }
            FunctionCode::Operate | FunctionCode::DirectOperate => {
                (mirror_controls(&database, &request.items, true), InternalIndications::default())
            }
            FunctionCode::Write
            | FunctionCode::ColdRestart
            | FunctionCode::WarmRestart
            | FunctionCode::EnableUnsolicited
            | FunctionCode::DisableUnsolicited => (Vec::new(), InternalIndications::default()),
            other => {
                debug!("outstation: ignoring function {other:?}");
                (
                    Vec::new(),
                    InternalIndications(InternalIndications::NO_FUNC_CODE_SUPPORT),
                )
            }
        };
        if let Err(e) = association.respond(seq, items, iin).await {
            warn!(
                "outstation: response on association {:?} failed: {e}",
                association.key
            );
        }
    }
}

/// Points of `map` addressed by `range`, in index order.
fn select_range<V: Copy>(map: &BTreeMap<u16, V>, range: Range) -> Vec<(u16, V)> {
    match range {
        Range::All => map.iter().map(|(k, v)| (*k, *v)).collect(),
        Range::StartStop { start, stop } => map
            .range(start.min(u32::from(u16::MAX)) as u16..=stop.min(u32::from(u16::MAX)) as u16)
            .map(|(k, v)| (*k, *v))
            .collect(),
        Range::Count(n) => map.iter().take(n as usize).map(|(k, v)| (*k, *v)).collect(),
    }
}

/// Group selected points into one response item per contiguous index run.
fn runs_to_items<V: Copy>(
    group: u8,
    variation: u8,
    selected: &[(u16, V)],
    instance: impl Fn(V) -> Option<ObjectInstance>,
) -> Option<Vec<ObjectItem>> {
    let mut items = Vec::new();
    let mut run: Vec<ObjectInstance> = Vec::new();
    let mut run_start = 0u16;
    let mut previous: Option<u16> = None;
    for (index, value) in selected {
        let decoded = instance(*value)?;
        match previous {
            Some(p) if *index == p + 1 => run.push(decoded),
            Some(_) => {
                items.push(ObjectItem::with_range_instances(
                    group,
                    variation,
                    u32::from(run_start),
                    std::mem::take(&mut run),
                ));
                run_start = *index;
                run.push(decoded);
            }
            None => {
                run_start = *index;
                run.push(decoded);
            }
        }
        previous = Some(*index);
    }
    if !run.is_empty() {
        items.push(ObjectItem::with_range_instances(
            group,
            variation,
            u32::from(run_start),
            run,
        ));
    }
    Some(items)
}

fn binary_input_instance(variation: u8, state: bool) -> Option<ObjectInstance> {
    match variation {
        1 => Some(ObjectInstance::BinaryInputPacked { value: state }),
        2 => Some(ObjectInstance::BinaryInputFlags {
            flags: FLAG_ONLINE | if state { FLAG_STATE } else { 0 },
        }),
        _ => None,
    }
}

fn counter_instance(variation: u8, value: u32) -> Option<ObjectInstance> {
    match variation {
        1 => Some(ObjectInstance::Counter32 { value, flags: FLAG_ONLINE }),
        2 => Some(ObjectInstance::Counter16 { value: value as u16, flags: FLAG_ONLINE }),
        5 => Some(ObjectInstance::Counter32NoFlag { value }),
        6 => Some(ObjectInstance::Counter16NoFlag { value: value as u16 }),
        _ => None,
    }
}

fn analog_instance(variation: u8, value: i32) -> Option<ObjectInstance> {
    match variation {
        1 => Some(ObjectInstance::AnalogInput32 { value, flags: FLAG_ONLINE }),
        2 => Some(ObjectInstance::AnalogInput16 { value: value as i16, flags: FLAG_ONLINE }),
        3 => Some(ObjectInstance::AnalogInput32NoFlag { value }),
        4 => Some(ObjectInstance::AnalogInput16NoFlag { value: value as i16 }),
        5 => Some(ObjectInstance::AnalogInputFloat { value: value as f32, flags: FLAG_ONLINE }),
        6 => Some(ObjectInstance::AnalogInputDouble {
            value: f64::from(value),
            flags: FLAG_ONLINE,
        }),
        _ => None,
    }
}

fn build_read_response(
    database: &Mutex<OutstationDatabase>,
    requested: &[ObjectItem],
) -> (Vec<ObjectItem>, InternalIndications) {
    let database = database.lock();
    let mut items: Vec<ObjectItem> = Vec::new();
    let mut iin = InternalIndications::default();
    let mut unknown = |iin: &mut InternalIndications| {
        iin.0 |= InternalIndications::OBJECT_UNKNOWN;
    };

    for item in requested {
        let range = item.header.range;
        let produced = match item.header.group {
            60 => match item.header.variation {
                1 => {
                    // Class 0: the whole database in input order.
                    let mut all = Vec::new();
                    let binaries: Vec<(u16, bool)> =
                        database.binary_inputs.iter().map(|(k, v)| (*k, *v)).collect();
                    all.extend(runs_to_items(1, 2, &binaries, |s| binary_input_instance(2, s))
                        .unwrap_or_default());
                    let outputs: Vec<(u16, bool)> =
                        database.binary_outputs.iter().map(|(k, v)| (*k, *v)).collect();
                    all.extend(
                        runs_to_items(10, 2, &outputs, |s| {
                            Some(ObjectInstance::BinaryOutputFlags {
                                flags: FLAG_ONLINE | if s { FLAG_STATE } else { 0 },
                            })
                        })
                        .unwrap_or_default(),
                    );
                    let counters: Vec<(u16, u32)> =
                        database.counters.iter().map(|(k, v)| (*k, *v)).collect();
                    all.extend(
                        runs_to_items(20, 1, &counters, |v| counter_instance(1, v))
                            .unwrap_or_default(),
                    );
                    let analogs: Vec<(u16, i32)> =
                        database.analog_inputs.iter().map(|(k, v)| (*k, *v)).collect();
                    all.extend(
                        runs_to_items(30, 1, &analogs, |v| analog_instance(1, v))
                            .unwrap_or_default(),
                    );
                    Some(all)
                }
                2..=4 => Some(Vec::new()), // no buffered events
                _ => None,
            },
            1 => {
                let selected = select_range(&database.binary_inputs, range);
                runs_to_items(1, item.header.variation, &selected, |s| {
                    binary_input_instance(item.header.variation, s)
                })
            }
            10 => {
                let selected = select_range(&database.binary_outputs, range);
                runs_to_items(10, 2, &selected, |s| {
                    Some(ObjectInstance::BinaryOutputFlags {
                        flags: FLAG_ONLINE | if s { FLAG_STATE } else { 0 },
                    })
                })
            }
            20 => {
                let selected = select_range(&database.counters, range);
                runs_to_items(20, item.header.variation, &selected, |v| {
                    counter_instance(item.header.variation, v)
                })
            }
            30 => {
                let selected = select_range(&database.analog_inputs, range);
                runs_to_items(30, item.header.variation, &selected, |v| {
                    analog_instance(item.header.variation, v)
                })
            }
            50 => Some(vec![ObjectItem::with_range_instances(
                50,
                1,
                0,
                vec![ObjectInstance::TimeAndDate {
                    millis: DateTime::now().as_unix_millis() as u64,
                }],
            )]),
            _ => None,
        };
        match produced {
            Some(produced) => items.extend(produced),
            None => unknown(&mut iin),
        }
    }
    (items, iin)
}

/// Apply controls and echo them back with a success status.
fn mirror_controls(
    database: &Mutex<OutstationDatabase>,
    requested: &[ObjectItem],
    operate: bool,
) -> Vec<ObjectItem> {
    let mut database = database.lock();
    let mut echoed = Vec::new();
    for item in requested {
        let mut entries = Vec::new();
        for (position, instance) in item.instances.iter().enumerate() {
            let Some(index) = item.instance_index(position) else {
                continue;
            };
            let echo = match instance {
                ObjectInstance::ControlRelayOutputBlock { code, .. } => {
                    if operate {
                        database
                            .binary_outputs
                            .insert(index as u16, code & 0x0F == CROB_LATCH_ON);
                    }
                    instance.clone()
                }
                ObjectInstance::AnalogOutput32 { value, .. } => {
                    if operate {
                        database.analog_outputs.insert(index as u16, f64::from(*value));
                    }
                    instance.clone()
                }
                ObjectInstance::AnalogOutput16 { value, .. } => {
                    if operate {
                        database.analog_outputs.insert(index as u16, f64::from(*value));
                    }
                    instance.clone()
                }
                ObjectInstance::AnalogOutputFloat { value, .. } => {
                    if operate {
                        database.analog_outputs.insert(index as u16, f64::from(*value));
                    }
                    instance.clone()
                }
                ObjectInstance::AnalogOutputDouble { value, .. } => {
                    if operate {
                        database.analog_outputs.insert(index as u16, *value);
                    }
                    instance.clone()
                }
                other => other.clone(),
            };
            entries.push((index, echo));
        }
        if !entries.is_empty() {
            echoed.push(ObjectItem::with_indexed_instances(
                item.header.group,
                item.header.variation,
                entries,
            ));
        }
    }
    echoed
}
