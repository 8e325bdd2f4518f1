use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use rvpf_core::config::{ApplicationConfig, DeviceConfig, LinkConfig};
use rvpf_core::{
    content, DateTime, Point, PointExchange, PointValue, ProtocolError, ReadResult, Value,
    WriteResult,
};

use crate::app::{FunctionCode, ObjectItem};
use crate::channel::ChannelConfig;
use crate::connection::Connection;
use crate::endpoint::{Association, EndPointOptions, RemoteEndPoint};
use crate::objects::{ObjectInstance, CROB_LATCH_OFF, CROB_LATCH_ON};

/// Point attributes consumed from the metadata collaborator.
pub const ATTR_GROUP: &str = "GROUP";
pub const ATTR_VARIATION: &str = "VARIATION";
pub const ATTR_INDEX: &str = "INDEX";
pub const ATTR_OUTPUT: &str = "OUTPUT";
/// Optional per-point outstation address, overriding the configured one.
pub const ATTR_REMOTE_ADDR: &str = "REMOTE_ADDR";

#[derive(Debug, Clone)]
pub struct Dnp3Config {
    /// Source address of this master.
    pub local_addr: u16,
    /// Destination address of the outstation.
    pub remote_addr: u16,
    pub link: LinkConfig,
    pub application: ApplicationConfig,
    /// Send user data as confirmed link frames.
    pub confirmed_user_data: bool,
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
}

impl Default for Dnp3Config {
    fn default() -> Self {
        Dnp3Config {
            local_addr: 1,
            remote_addr: 10,
            link: LinkConfig::default(),
            application: ApplicationConfig::default(),
            confirmed_user_data: false,
            connect_retries: 3,
            connect_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Protocol address of one point, parsed from its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dnp3PointAddress {
    pub group: u8,
    pub variation: u8,
    pub index: u16,
    pub output: bool,
    pub remote_addr: Option<u16>,
}

impl Dnp3PointAddress {
    pub fn from_point(point: &Point) -> Result<Dnp3PointAddress, ProtocolError> {
        let output = matches!(
            point.attribute(ATTR_OUTPUT).map(str::to_ascii_lowercase).as_deref(),
            Some("1") | Some("true") | Some("yes")
        );
        let remote_addr = match point.attribute(ATTR_REMOTE_ADDR) {
            Some(_) => Some(point.parse_attribute::<u16>(ATTR_REMOTE_ADDR)?),
            None => None,
        };
        Ok(Dnp3PointAddress {
            group: point.parse_attribute(ATTR_GROUP)?,
            variation: point.parse_attribute(ATTR_VARIATION)?,
            index: point.parse_attribute(ATTR_INDEX)?,
            output,
            remote_addr,
        })
    }
}

struct PendingRead {
    position: usize,
    point: Point,
    address: Dnp3PointAddress,
}

struct PendingWrite {
    position: usize,
    value: PointValue,
    point: Point,
    address: Dnp3PointAddress,
    instance: ObjectInstance,
    /// Group the echoed object comes back under.
    echo_group: u8,
}

/// DNP3 master: queues point reads and writes and commits them as
/// batched request fragments, one association per outstation address.
pub struct Dnp3Master {
    id: String,
    config: Dnp3Config,
    channel: ChannelConfig,
    connection: Option<Connection>,
    endpoint: Option<Arc<RemoteEndPoint>>,
    queued_reads: Vec<Point>,
    queued_writes: Vec<(PointValue, Point)>,
}

impl Dnp3Master {
    pub fn new(id: impl Into<String>, channel: ChannelConfig, config: Dnp3Config) -> Dnp3Master {
        Dnp3Master {
            id: id.into(),
            config,
            channel,
            connection: None,
            endpoint: None,
            queued_reads: Vec::new(),
            queued_writes: Vec::new(),
        }
    }

    /// Build a master from a device entry; `params` holds the protocol
    /// knobs as strings.
    pub fn from_device(device: &DeviceConfig) -> anyhow::Result<Dnp3Master> {
        use anyhow::Context;

        let params = &device.params;
        let mut config = Dnp3Config::default();
        if let Some(raw) = params.get("local_addr") {
            config.local_addr = raw.parse().context("local_addr")?;
        }
        if let Some(raw) = params.get("remote_addr") {
            config.remote_addr = raw.parse().context("remote_addr")?;
        }
        if let Some(raw) = params.get("link_timeout_ms") {
            config.link.timeout = Duration::from_millis(raw.parse().context("link_timeout_ms")?);
        }
        if let Some(raw) = params.get("link_keepalive_ms") {
            config.link.keepalive =
                Some(Duration::from_millis(raw.parse().context("link_keepalive_ms")?));
        }
        if let Some(raw) = params.get("link_retries") {
            config.link.retries = raw.parse().context("link_retries")?;
        }
        if let Some(raw) = params.get("application_timeout_ms") {
            config.application.timeout =
                Duration::from_millis(raw.parse().context("application_timeout_ms")?);
        }
        if let Some(raw) = params.get("max_fragment_size") {
            config.application.max_fragment_size =
                raw.parse().context("max_fragment_size")?;
        }
        if let Some(raw) = params.get("confirmed_user_data") {
            config.confirmed_user_data = raw.parse().context("confirmed_user_data")?;
        }

        let channel = match params.get("transport").map(String::as_str).unwrap_or("tcp") {
            "tcp" => ChannelConfig::Tcp {
                target: device.target.parse().context("target address")?,
            },
            "udp" => ChannelConfig::Udp {
                bind: params
                    .get("bind")
                    .map(String::as_str)
                    .unwrap_or("0.0.0.0:0")
                    .parse()
                    .context("bind address")?,
                peer: device.target.parse().context("target address")?,
            },
            "serial" => {
                let mut serial = rvpf_core::config::SerialConfig {
                    port_name: device.target.clone(),
                    ..Default::default()
                };
                if let Some(raw) = params.get("speed") {
                    serial.speed = raw.parse().context("speed")?;
                }
                if let Some(raw) = params.get("data_bits") {
                    serial.data_bits = raw.parse().context("data_bits")?;
                }
                if let Some(raw) = params.get("parity") {
                    serial.parity = raw.clone();
                }
                if let Some(raw) = params.get("stop_bits") {
                    serial.stop_bits = raw.parse().context("stop_bits")?;
                }
                ChannelConfig::Serial(serial)
            }
            other => anyhow::bail!("unsupported transport: {other}"),
        };

        Ok(Dnp3Master::new(device.id.clone(), channel, config))
    }

    fn endpoint_options(&self) -> EndPointOptions {
        EndPointOptions {
            link: self.config.link.clone(),
            application: self.config.application.clone(),
            confirmed_user_data: self.config.confirmed_user_data,
            master: true,
            auto_create: false,
            expected_local: Some(self.config.local_addr),
        }
    }

    async fn ensure_connected(&mut self) -> Result<Arc<RemoteEndPoint>, ProtocolError> {
        if let (Some(connection), Some(endpoint)) = (&self.connection, &self.endpoint) {
            if !connection.is_closed() {
                return Ok(endpoint.clone());
            }
            debug!("{}: connection lost, reopening", self.id);
        }

        let mut last_error =
            ProtocolError::ServiceUnavailable("no connection attempt made".to_string());
        for attempt in 0..=self.config.connect_retries {
            match RemoteEndPoint::open(
                self.config.remote_addr,
                &self.channel,
                self.endpoint_options(),
            )
            .await
            {
                Ok((connection, endpoint)) => {
                    info!("{}: connected", self.id);
                    self.connection = Some(connection);
                    self.endpoint = Some(endpoint.clone());
                    return Ok(endpoint);
                }
                Err(e) => {
                    warn!("{}: connect attempt {attempt} failed: {e}", self.id);
                    last_error = e;
                }
            }
            if attempt < self.config.connect_retries {
                tokio::time::sleep(self.config.connect_retry_delay * (attempt + 1)).await;
            }
        }
        Err(last_error)
    }

    fn association_for(
        &self,
        endpoint: &Arc<RemoteEndPoint>,
        remote_addr: Option<u16>,
    ) -> Arc<Association> {
        endpoint.association(
            self.config.local_addr,
            remote_addr.unwrap_or(self.config.remote_addr),
        )
    }

    /// Class-0 integrity poll: every static value the outstation holds,
    /// as decoded response items.
    pub async fn integrity_poll(&mut self) -> Result<Vec<ObjectItem>, ProtocolError> {
        let endpoint = self.ensure_connected().await?;
        let association = self.association_for(&endpoint, None);
        let (items, _iin) = association
            .transact(
                FunctionCode::Read,
                vec![ObjectItem::read_all(60, 1)],
                self.config.application.timeout,
            )
            .await?;
        Ok(items)
    }

    /// Request a restart of the outstation's application (function 13/14).
    pub async fn restart(&mut self, cold: bool) -> Result<(), ProtocolError> {
        let endpoint = self.ensure_connected().await?;
        let association = self.association_for(&endpoint, None);
        let function = if cold {
            FunctionCode::ColdRestart
        } else {
            FunctionCode::WarmRestart
        };
        association
            .transact(function, Vec::new(), self.config.application.timeout)
            .await
            .map(|_| ())
    }

    /// Enable or disable unsolicited responses for event classes 1..=3.
    pub async fn set_unsolicited(
        &mut self,
        enabled: bool,
        classes: &[u8],
    ) -> Result<(), ProtocolError> {
        let endpoint = self.ensure_connected().await?;
        let association = self.association_for(&endpoint, None);
        let items = classes
            .iter()
            .filter(|class| (1..=3).contains(*class))
            .map(|class| ObjectItem::read_all(60, class + 1))
            .collect();
        let function = if enabled {
            FunctionCode::EnableUnsolicited
        } else {
            FunctionCode::DisableUnsolicited
        };
        association
            .transact(function, items, self.config.application.timeout)
            .await
            .map(|_| ())
    }

    async fn run_reads(&mut self, queued: Vec<Point>) -> Vec<ReadResult> {
        let mut slots: Vec<Option<ReadResult>> = (0..queued.len()).map(|_| None).collect();
        let mut by_remote: BTreeMap<u16, Vec<PendingRead>> = BTreeMap::new();

        for (position, point) in queued.into_iter().enumerate() {
            match Dnp3PointAddress::from_point(&point) {
                Ok(address) => {
                    let remote = address.remote_addr.unwrap_or(self.config.remote_addr);
                    by_remote.entry(remote).or_default().push(PendingRead {
                        position,
                        point,
                        address,
                    });
                }
                Err(e) => {
                    slots[position] = Some(ReadResult {
                        point,
                        outcome: Err(e),
                    });
                }
            }
        }

        let endpoint = match self.ensure_connected().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                for group in by_remote.into_values() {
                    for pending in group {
                        slots[pending.position] = Some(ReadResult {
                            point: pending.point,
                            outcome: Err(e.clone()),
                        });
                    }
                }
                return slots.into_iter().flatten().collect();
            }
        };

        let timeout = self.config.application.timeout;
        let max_fragment = self.config.application.max_fragment_size;
        for (remote, group) in by_remote {
            let association = endpoint.association(self.config.local_addr, remote);

            // Coalesce contiguous indices of the same (group, variation)
            // into start-stop items.
            let mut wanted: BTreeMap<(u8, u8), BTreeSet<u32>> = BTreeMap::new();
            for pending in &group {
                wanted
                    .entry((pending.address.group, pending.address.variation))
                    .or_default()
                    .insert(u32::from(pending.address.index));
            }
            let mut items = Vec::new();
            for ((object_group, variation), indices) in &wanted {
                for (start, stop) in contiguous_runs(indices) {
                    items.push(ObjectItem::read_range(*object_group, *variation, start, stop));
                }
            }

            let chunks = crate::app::pack_items(items, FunctionCode::Read, max_fragment);
            let mut values: HashMap<(u8, u32), Result<Value, ProtocolError>> = HashMap::new();
            let mut failed: Option<ProtocolError> = None;
            for chunk in chunks {
                // Fail fast: the first failing fragment cancels the rest
                // for this remote.
                if failed.is_some() {
                    break;
                }
                match association.transact(FunctionCode::Read, chunk, timeout).await {
                    Ok((response_items, _iin)) => {
                        for item in response_items {
                            for (position, instance) in item.instances.iter().enumerate() {
                                if let Some(index) = item.instance_index(position) {
                                    values.insert(
                                        (item.header.group, index),
                                        instance.value(),
                                    );
                                }
                            }
                        }
                    }
                    Err(e) => failed = Some(e),
                }
            }

            for pending in group {
                let outcome = if let Some(error) = &failed {
                    Err(error.clone())
                } else {
                    read_outcome(&values, &pending)
                };
                slots[pending.position] = Some(ReadResult {
                    point: pending.point,
                    outcome,
                });
            }
        }

        slots.into_iter().flatten().collect()
    }

    async fn run_writes(&mut self, queued: Vec<(PointValue, Point)>) -> Vec<WriteResult> {
        let mut slots: Vec<Option<WriteResult>> = (0..queued.len()).map(|_| None).collect();
        let mut by_remote: BTreeMap<u16, Vec<PendingWrite>> = BTreeMap::new();

        for (position, (value, point)) in queued.into_iter().enumerate() {
            match prepare_write(&point, &value) {
                Ok((address, instance, echo_group)) => {
                    let remote = address.remote_addr.unwrap_or(self.config.remote_addr);
                    by_remote.entry(remote).or_default().push(PendingWrite {
                        position,
                        value,
                        point,
                        address,
                        instance,
                        echo_group,
                    });
                }
                Err(e) => {
                    // A bad value fails its own request; the batch goes on.
                    slots[position] = Some(WriteResult {
                        value,
                        outcome: Err(e),
                    });
                }
            }
        }

        let endpoint = match self.ensure_connected().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                for group in by_remote.into_values() {
                    for pending in group {
                        slots[pending.position] = Some(WriteResult {
                            value: pending.value,
                            outcome: Err(e.clone()),
                        });
                    }
                }
                return slots.into_iter().flatten().collect();
            }
        };

        let timeout = self.config.application.timeout;
        let max_fragment = self.config.application.max_fragment_size;
        for (remote, group) in by_remote {
            let association = endpoint.association(self.config.local_addr, remote);

            let mut by_object: BTreeMap<(u8, u8), Vec<(u32, ObjectInstance)>> = BTreeMap::new();
            for pending in &group {
                let (object_group, variation) = pending.instance.group_variation();
                by_object
                    .entry((object_group, variation))
                    .or_default()
                    .push((u32::from(pending.address.index), pending.instance.clone()));
            }
            let items: Vec<ObjectItem> = by_object
                .into_iter()
                .map(|((object_group, variation), entries)| {
                    ObjectItem::with_indexed_instances(object_group, variation, entries)
                })
                .collect();

            let chunks = crate::app::pack_items(items, FunctionCode::DirectOperate, max_fragment);
            let mut echoes: HashMap<(u8, u32), u8> = HashMap::new();
            let mut failed: Option<ProtocolError> = None;
            for chunk in chunks {
                if failed.is_some() {
                    break;
                }
                match association
                    .transact(FunctionCode::DirectOperate, chunk, timeout)
                    .await
                {
                    Ok((response_items, _iin)) => {
                        for item in response_items {
                            for (position, instance) in item.instances.iter().enumerate() {
                                if let (Some(index), Some(status)) = (
                                    item.instance_index(position),
                                    instance.control_status(),
                                ) {
                                    echoes.insert((item.header.group, index), status);
                                }
                            }
                        }
                    }
                    Err(e) => failed = Some(e),
                }
            }

            for pending in group {
                let outcome = if let Some(error) = &failed {
                    Err(error.clone())
                } else {
                    match echoes.get(&(pending.echo_group, u32::from(pending.address.index))) {
                        Some(0) => Ok(()),
                        Some(status) => Err(ProtocolError::BadValue(format!(
                            "device rejected control with status {status}"
                        ))),
                        None => Err(ProtocolError::UnexpectedResponse),
                    }
                };
                slots[pending.position] = Some(WriteResult {
                    value: pending.value,
                    outcome,
                });
            }
        }

        slots.into_iter().flatten().collect()
    }
}

fn contiguous_runs(indices: &BTreeSet<u32>) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut iter = indices.iter().copied();
    let Some(first) = iter.next() else {
        return runs;
    };
    let (mut start, mut stop) = (first, first);
    for index in iter {
        if index == stop + 1 {
            stop = index;
        } else {
            runs.push((start, stop));
            start = index;
            stop = index;
        }
    }
    runs.push((start, stop));
    runs
}

fn read_outcome(
    values: &HashMap<(u8, u32), Result<Value, ProtocolError>>,
    pending: &PendingRead,
) -> Result<PointValue, ProtocolError> {
    match values.get(&(pending.address.group, u32::from(pending.address.index))) {
        Some(Ok(raw)) => {
            let value = content::decode(pending.point.content, raw)?;
            Ok(PointValue::new(&pending.point, DateTime::now(), value))
        }
        Some(Err(e)) => Err(e.clone()),
        None => Err(ProtocolError::UnexpectedResponse),
    }
}

fn prepare_write(
    point: &Point,
    value: &PointValue,
) -> Result<(Dnp3PointAddress, ObjectInstance, u8), ProtocolError> {
    let address = Dnp3PointAddress::from_point(point)?;
    if !address.output {
        return Err(ProtocolError::BadValue(format!(
            "point {} is not an output",
            point.name
        )));
    }
    let raw = value
        .value
        .as_ref()
        .ok_or_else(|| ProtocolError::BadValue(format!("point {} has no value", point.name)))?;
    let native = content::encode(point.content, raw)?;

    let instance = match address.group {
        // Binary outputs are driven through the command group.
        10 | 12 => ObjectInstance::ControlRelayOutputBlock {
            code: if native.as_bool()? { CROB_LATCH_ON } else { CROB_LATCH_OFF },
            count: 1,
            on_time_ms: 0,
            off_time_ms: 0,
            status: 0,
        },
        41 => match address.variation {
            1 => ObjectInstance::AnalogOutput32 {
                value: native.as_long()? as i32,
                status: 0,
            },
            2 => ObjectInstance::AnalogOutput16 {
                value: native.as_long()? as i16,
                status: 0,
            },
            3 => ObjectInstance::AnalogOutputFloat {
                value: native.as_double()? as f32,
                status: 0,
            },
            4 => ObjectInstance::AnalogOutputDouble {
                value: native.as_double()?,
                status: 0,
            },
            other => {
                return Err(ProtocolError::UnsupportedObject {
                    group: 41,
                    variation: other,
                })
            }
        },
        other => {
            return Err(ProtocolError::BadValue(format!(
                "group {other} is not writable"
            )))
        }
    };
    let echo_group = instance.group_variation().0;
    Ok((address, instance, echo_group))
}

#[async_trait]
impl PointExchange for Dnp3Master {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.ensure_connected().await.map(|_| ())
    }

    fn request_read(&mut self, point: Point) {
        self.queued_reads.push(point);
    }

    fn request_write(&mut self, value: PointValue, point: Point) {
        self.queued_writes.push((value, point));
    }

    fn rollback_reads(&mut self) {
        self.queued_reads.clear();
    }

    fn rollback_writes(&mut self) {
        self.queued_writes.clear();
    }

    async fn commit_reads(&mut self) -> Vec<ReadResult> {
        let queued = std::mem::take(&mut self.queued_reads);
        if queued.is_empty() {
            return Vec::new();
        }
        self.run_reads(queued).await
    }

    async fn commit_writes(&mut self) -> Vec<WriteResult> {
        let queued = std::mem::take(&mut self.queued_writes);
        if queued.is_empty() {
            return Vec::new();
        }
        self.run_writes(queued).await
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.cancel_all(ProtocolError::Cancelled);
        }
        if let Some(connection) = self.connection.take() {
            connection.close("disconnect requested");
        }
        self.queued_reads.clear();
        self.queued_writes.clear();
        Ok(())
    }
}
