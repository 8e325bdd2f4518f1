//! Master/outstation round trips over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use rvpf_core::config::ApplicationConfig;
use rvpf_core::content::ContentKind;
use rvpf_core::{DateTime, Point, PointExchange, PointValue, ProtocolError, Value};
use rvpf_dnp3::master::{ATTR_GROUP, ATTR_INDEX, ATTR_OUTPUT, ATTR_VARIATION};
use rvpf_dnp3::{
    ChannelConfig, Dnp3Config, Dnp3Master, Dnp3Outstation, ObjectInstance, OutstationDatabase,
};

const MASTER_ADDR: u16 = 1;
const OUTSTATION_ADDR: u16 = 10;

async fn start_outstation(
    application: ApplicationConfig,
) -> (
    std::net::SocketAddr,
    Arc<Mutex<OutstationDatabase>>,
    tokio::task::JoinHandle<()>,
) {
    let outstation = Dnp3Outstation::bind("127.0.0.1:0", OUTSTATION_ADDR, application)
        .await
        .unwrap();
    let addr = outstation.listen_addr().unwrap();
    let database = outstation.database();
    let handle = outstation.spawn();
    (addr, database, handle)
}

fn master_for(addr: std::net::SocketAddr) -> Dnp3Master {
    let mut config = Dnp3Config {
        local_addr: MASTER_ADDR,
        remote_addr: OUTSTATION_ADDR,
        ..Dnp3Config::default()
    };
    config.link.timeout = Duration::from_millis(500);
    config.application.timeout = Duration::from_millis(2000);
    config.connect_retries = 1;
    Dnp3Master::new("dnp3-test", ChannelConfig::Tcp { target: addr }, config)
}

fn analog_input_point(index: u16) -> Point {
    Point::new(format!("plant.analog.{index}"), "rtu-test")
        .with_content(ContentKind::Count)
        .with_attribute(ATTR_GROUP, 30)
        .with_attribute(ATTR_VARIATION, 2)
        .with_attribute(ATTR_INDEX, index)
}

#[tokio::test]
async fn analog_input_read_round_trip() {
    let (addr, database, _outstation) = start_outstation(ApplicationConfig::default()).await;
    database.lock().analog_inputs.insert(3, 1234);

    let mut master = master_for(addr);
    let values = master.fetch_point_values(&[analog_input_point(3)]).await;
    let value = values[0].as_ref().expect("read must succeed");
    assert_eq!(value.value, Some(Value::Long(1234)));
    assert!(!value.deleted);
}

#[tokio::test]
async fn binary_output_write_and_read_back() {
    let (addr, _database, _outstation) = start_outstation(ApplicationConfig::default()).await;
    let mut master = master_for(addr);

    let command_point = Point::new("plant.breaker.close", "rtu-test")
        .with_content(ContentKind::Logical)
        .with_attribute(ATTR_GROUP, 12)
        .with_attribute(ATTR_VARIATION, 1)
        .with_attribute(ATTR_INDEX, 7)
        .with_attribute(ATTR_OUTPUT, "true");
    let command = PointValue::new(&command_point, DateTime::now(), Value::Bool(true));

    let errors = master
        .update_point_values(&[(command, command_point)])
        .await;
    assert_eq!(errors, vec![None]);

    let status_point = Point::new("plant.breaker.status", "rtu-test")
        .with_content(ContentKind::Logical)
        .with_attribute(ATTR_GROUP, 10)
        .with_attribute(ATTR_VARIATION, 2)
        .with_attribute(ATTR_INDEX, 7);
    let values = master.fetch_point_values(&[status_point]).await;
    assert_eq!(
        values[0].as_ref().unwrap().value,
        Some(Value::Bool(true))
    );
}

#[tokio::test]
async fn fragmented_class_zero_poll() {
    // Small outstation fragments force the response to span several
    // confirmable application fragments.
    let (addr, database, _outstation) = start_outstation(ApplicationConfig {
        timeout: Duration::from_millis(2000),
        max_fragment_size: 256,
    })
    .await;
    {
        let mut database = database.lock();
        for index in 0..200u16 {
            database.analog_inputs.insert(index, i32::from(index) * 3);
        }
    }

    let mut master = master_for(addr);
    let items = master.integrity_poll().await.expect("poll must succeed");

    let collected: Vec<i32> = items
        .iter()
        .flat_map(|item| item.instances.iter())
        .map(|instance| match instance {
            ObjectInstance::AnalogInput32 { value, .. } => *value,
            other => panic!("unexpected instance {other:?}"),
        })
        .collect();
    assert_eq!(collected.len(), 200);
    // All values present, in input order.
    for (position, value) in collected.iter().enumerate() {
        assert_eq!(*value, position as i32 * 3);
    }
    // The response could not have fit one fragment.
    assert!(items.len() >= 2);
}

#[tokio::test]
async fn batched_reads_resolve_per_request() {
    let (addr, database, _outstation) = start_outstation(ApplicationConfig::default()).await;
    database.lock().analog_inputs.insert(1, 11);
    database.lock().analog_inputs.insert(2, 22);

    let mut master = master_for(addr);
    master.request_read(analog_input_point(1));
    master.request_read(analog_input_point(2));
    // Missing from the outstation: resolves per-request, not per-batch.
    master.request_read(analog_input_point(9));
    let results = master.commit_reads().await;

    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].outcome.as_ref().unwrap().value,
        Some(Value::Long(11))
    );
    assert_eq!(
        results[1].outcome.as_ref().unwrap().value,
        Some(Value::Long(22))
    );
    assert!(matches!(
        results[2].outcome,
        Err(ProtocolError::UnexpectedResponse)
    ));
}

#[tokio::test]
async fn rollback_discards_queued_requests() {
    let (addr, _database, _outstation) = start_outstation(ApplicationConfig::default()).await;
    let mut master = master_for(addr);
    master.request_read(analog_input_point(1));
    master.rollback_reads();
    assert!(master.commit_reads().await.is_empty());
}

#[tokio::test]
async fn connect_to_dead_port_is_service_unavailable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut master = master_for(addr);
    let result = master.connect().await;
    assert!(matches!(result, Err(ProtocolError::ServiceUnavailable(_))));

    // A failed connect fails every queued request the same way.
    master.request_read(analog_input_point(1));
    let results = master.commit_reads().await;
    assert!(matches!(
        results[0].outcome,
        Err(ProtocolError::ServiceUnavailable(_))
    ));
}
