//! Mock sensors, controls, controllers, and FRU sources for the
//! integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use backplane_records::DeviceNum;
use tokio::sync::watch;

use backplane_core::{
    Control, ControlType, DiscreteStates, DomainConfig, EntityRegistry, EventMask, EventSupport,
    FruAddress, FruData, FruSource, IndicatorSpec, ManagementController, McMessage, McResolver,
    McResponse, RequesterSpec, Sensor,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
}

pub fn registry() -> EntityRegistry {
    init_tracing();
    EntityRegistry::new(DomainConfig::default())
}

pub struct MockSensor {
    id: String,
    sensor_type: u8,
    readable: u16,
    requester: Option<RequesterSpec>,
    states: Mutex<DiscreteStates>,
    fail_reads: AtomicBool,
    pub reads: AtomicUsize,
    pub enables: Mutex<Vec<EventMask>>,
}

impl MockSensor {
    fn new(id: &str, sensor_type: u8, readable: u16) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            sensor_type,
            readable,
            requester: None,
            states: Mutex::new(DiscreteStates::default()),
            fail_reads: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            enables: Mutex::new(Vec::new()),
        })
    }

    /// A dedicated presence sensor with readable present/absent bits.
    pub fn presence(id: &str) -> Arc<Self> {
        Self::new(id, 0x25, 0b11)
    }

    /// A power-supply sensor whose bit 0 is the presence bit.
    pub fn power_supply(id: &str) -> Arc<Self> {
        Self::new(id, 0x08, 0b1)
    }

    /// A plain discrete sensor with no special classification.
    pub fn plain(id: &str) -> Arc<Self> {
        Self::new(id, 0x02, 0)
    }

    /// A hot-swap requester watching `offset`, asserted means requesting.
    pub fn requester(id: &str, offset: u8) -> Arc<Self> {
        let mut sensor = Self::new(id, 0xf0, 1 << offset);
        Arc::get_mut(&mut sensor).unwrap().requester =
            Some(RequesterSpec { offset, requesting_val: true });
        sensor
    }

    pub fn set_states(&self, states: DiscreteStates) {
        *self.states.lock().unwrap() = states;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }
}

#[async_trait]
impl Sensor for MockSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn sensor_type(&self) -> u8 {
        self.sensor_type
    }

    fn event_support(&self) -> EventSupport {
        EventSupport::PerState
    }

    fn state_readable(&self, offset: u8) -> bool {
        offset < 16 && self.readable & (1 << offset) != 0
    }

    fn hot_swap_requester(&self) -> Option<RequesterSpec> {
        self.requester
    }

    async fn read_states(&self) -> Result<DiscreteStates> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        if self.fail_reads.load(Ordering::Acquire) {
            bail!("sensor {} unreachable", self.id);
        }
        Ok(*self.states.lock().unwrap())
    }

    async fn enable_events(&self, mask: EventMask) -> Result<()> {
        self.enables.lock().unwrap().push(mask);
        Ok(())
    }
}

pub struct MockControl {
    id: String,
    control_type: ControlType,
    power: bool,
    indicator: Option<IndicatorSpec>,
    value: Mutex<i32>,
    fail_sets: AtomicBool,
    pub sets: Mutex<Vec<i32>>,
}

impl MockControl {
    pub fn power(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            control_type: ControlType::Power,
            power: true,
            indicator: None,
            value: Mutex::new(0),
            fail_sets: AtomicBool::new(false),
            sets: Mutex::new(Vec::new()),
        })
    }

    pub fn indicator(id: &str, spec: IndicatorSpec) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            control_type: ControlType::Light,
            power: false,
            indicator: Some(spec),
            value: Mutex::new(0),
            fail_sets: AtomicBool::new(false),
            sets: Mutex::new(Vec::new()),
        })
    }

    pub fn set_current(&self, val: i32) {
        *self.value.lock().unwrap() = val;
    }

    pub fn current(&self) -> i32 {
        *self.value.lock().unwrap()
    }

    pub fn set_fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::Release);
    }

    pub fn set_count(&self) -> usize {
        self.sets.lock().unwrap().len()
    }
}

#[async_trait]
impl Control for MockControl {
    fn id(&self) -> &str {
        &self.id
    }

    fn control_type(&self) -> ControlType {
        self.control_type
    }

    fn is_hot_swap_power(&self) -> bool {
        self.power
    }

    fn hot_swap_indicator(&self) -> Option<IndicatorSpec> {
        self.indicator
    }

    async fn get_value(&self) -> Result<i32> {
        Ok(*self.value.lock().unwrap())
    }

    async fn set_value(&self, val: i32) -> Result<()> {
        if self.fail_sets.load(Ordering::Acquire) {
            bail!("control {} unreachable", self.id);
        }
        *self.value.lock().unwrap() = val;
        self.sets.lock().unwrap().push(val);
        Ok(())
    }
}

pub struct MockMc {
    address: DeviceNum,
    active: watch::Sender<bool>,
    pub scans: AtomicUsize,
}

impl MockMc {
    pub fn new(channel: u8, address: u8, active: bool) -> Arc<Self> {
        let (tx, _) = watch::channel(active);
        Arc::new(Self {
            address: DeviceNum::new(channel, address),
            active: tx,
            scans: AtomicUsize::new(0),
        })
    }

    pub fn set_active(&self, active: bool) {
        let _ = self.active.send(active);
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ManagementController for MockMc {
    fn address(&self) -> DeviceNum {
        self.address
    }

    fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    fn active_watch(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    async fn start_scan(&self) -> Result<()> {
        self.scans.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn send_command(&self, _lun: u8, msg: McMessage) -> Result<McResponse> {
        Ok(McResponse { completion: 0, data: msg.data })
    }
}

#[derive(Default)]
pub struct MockResolver {
    mcs: Mutex<HashMap<(u8, u8), Arc<MockMc>>>,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, mc: Arc<MockMc>) {
        let addr = mc.address;
        self.mcs.lock().unwrap().insert((addr.channel, addr.address), mc);
    }
}

impl McResolver for MockResolver {
    fn resolve(&self, channel: u8, address: u8) -> Option<Arc<dyn ManagementController>> {
        self.mcs
            .lock()
            .unwrap()
            .get(&(channel, address))
            .cloned()
            .map(|mc| mc as Arc<dyn ManagementController>)
    }
}

pub struct MockFruSource {
    pub fetches: AtomicUsize,
}

impl MockFruSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { fetches: AtomicUsize::new(0) })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }
}

#[async_trait]
impl FruSource for MockFruSource {
    async fn fetch(&self, addr: &FruAddress) -> Result<FruData> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        Ok(FruData {
            manufacturer: Some("Initech".to_string()),
            product: Some(format!("fru-{}", addr.fru_device_id)),
            serial: Some("0001".to_string()),
            part_number: None,
            raw: Vec::new(),
        })
    }
}
