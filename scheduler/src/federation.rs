//! Federation: one schedule fanned out to several telescopes
//!
//! The federation keeps a schedule of its own plus a queue of mosaic jobs.
//! Starting it hands every idle, controllable member a copy of the
//! schedule, with mosaics split according to their `federation_mode`.

use crate::error::SchedulerResult;
use crate::item::{FederationMode, MosaicItem, ScheduleAction, ScheduleItem};
use crate::schedule::{Schedule, ScheduleState};
use crate::scheduler::{DeviceScheduler, StartRequest, ACTIVE_MESSAGE};
use futures::future::join_all;
use rand::seq::SliceRandom;
use seestar_device::CommandResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

/// Options of the federation's `start_scheduler`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FederationStartRequest {
    /// Use at most this many of the available devices
    #[serde(default)]
    pub max_devices: Option<usize>,
}

/// Aggregated view of the federation and its members
#[derive(Debug, Clone, Serialize)]
pub struct FederationSchedule {
    pub schedule_id: String,
    pub state: ScheduleState,
    pub list: Vec<ScheduleItem>,
    pub job_queue: Vec<ScheduleItem>,
    pub devices: BTreeMap<String, Schedule>,
    pub available_devices: Vec<String>,
}

pub struct Federation {
    members: Vec<Arc<DeviceScheduler>>,
    schedule: RwLock<Schedule>,
    jobs: Mutex<VecDeque<ScheduleItem>>,
}

impl Federation {
    pub fn new(members: Vec<Arc<DeviceScheduler>>) -> Self {
        Self {
            members,
            schedule: RwLock::new(Schedule::new(None)),
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn members(&self) -> &[Arc<DeviceScheduler>] {
        &self.members
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Schedule> {
        self.schedule.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Schedule> {
        self.schedule.write().unwrap_or_else(|p| p.into_inner())
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, VecDeque<ScheduleItem>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Members that are connected, idle and under our control
    pub fn available_devices(&self) -> Vec<Arc<DeviceScheduler>> {
        self.members
            .iter()
            .filter(|member| {
                member.session().is_connected()
                    && member.state().is_idle()
                    && member.session().is_client_master()
            })
            .cloned()
            .collect()
    }

    fn any_member_running(&self) -> bool {
        self.members.iter().any(|m| m.state().is_running())
    }

    pub fn create_schedule(&self, schedule_id: Option<String>) -> FederationSchedule {
        if self.any_member_running() {
            warn!("Federation: a member scheduler is still active");
        } else {
            *self.write() = Schedule::new(schedule_id);
        }
        self.get_schedule()
    }

    /// Append an item; a mosaic at the current position is left for each
    /// device to resolve
    pub fn add_schedule_item(&self, request: &Value) -> SchedulerResult<FederationSchedule> {
        let mut item = ScheduleItem::from_request(request)?;
        item.normalize_target(None);
        self.write().list.push(item);
        Ok(self.get_schedule())
    }

    /// Queue a mosaic request; returns the queue length
    pub fn queue_mosaic_job(&self, params: &Value) -> SchedulerResult<usize> {
        let mut item =
            ScheduleItem::from_request(&json!({"action": "start_mosaic", "params": params}))?;
        item.normalize_target(None);
        let mut jobs = self.jobs();
        jobs.push_back(item);
        Ok(jobs.len())
    }

    pub fn get_schedule(&self) -> FederationSchedule {
        let schedule = self.read().clone();
        let devices = self
            .members
            .iter()
            .map(|m| (m.name().to_string(), m.get_schedule()))
            .collect();
        let available_devices = self
            .available_devices()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        let state = self.current_state();
        FederationSchedule {
            schedule_id: schedule.schedule_id,
            state,
            list: schedule.list,
            job_queue: self.jobs().iter().cloned().collect(),
            devices,
            available_devices,
        }
    }

    fn current_state(&self) -> ScheduleState {
        let stored = self.read().state;
        if self.any_member_running() {
            ScheduleState::Working
        } else if stored == ScheduleState::Working {
            ScheduleState::Complete
        } else {
            stored
        }
    }

    /// Hand the schedule plus the queued jobs to the available members
    ///
    /// Queued jobs move onto the schedule only once a member has started.
    pub fn start_scheduler(&self, request: FederationStartRequest) -> CommandResult {
        if !self.current_state().is_idle() {
            return CommandResult::new("start_scheduler", -1, json!(ACTIVE_MESSAGE));
        }

        let (schedule_id, mut list) = {
            let schedule = self.read();
            (schedule.schedule_id.clone(), schedule.list.clone())
        };
        let queued: Vec<ScheduleItem> = self.jobs().iter().cloned().collect();
        list.extend(queued.iter().cloned());
        if list.is_empty() {
            return CommandResult::new("start_scheduler", -1, json!("Schedule is empty."));
        }

        let mut devices = self.available_devices();
        if devices.is_empty() {
            return CommandResult::new("start_scheduler", -1, json!("No available devices."));
        }
        devices.shuffle(&mut rand::thread_rng());
        if let Some(max) = request.max_devices {
            devices.truncate(max.max(1));
        }

        let plans = plan_device_items(&list, devices.len());
        let mut started = Map::new();
        let mut any_started = false;
        for (device, items) in devices.iter().zip(plans) {
            if items.is_empty() {
                continue;
            }
            device.create_schedule(Some(schedule_id.clone()));
            device.add_items(&items);
            let result = device.start_scheduler(StartRequest {
                schedule_id: Some(schedule_id.clone()),
                start_item: None,
            });
            info!(
                "Federation: started {} with {} items (code {})",
                device.name(),
                items.len(),
                result.code
            );
            any_started |= result.is_ok();
            started.insert(device.name().to_string(), result.to_value());
        }

        if !any_started {
            return CommandResult::new("start_scheduler", -1, Value::Object(started));
        }

        {
            let mut jobs = self.jobs();
            let mut schedule = self.write();
            let taken = queued.len().min(jobs.len());
            schedule.list.extend(jobs.drain(..taken));
            schedule.state = ScheduleState::Working;
        }
        CommandResult::ok("start_scheduler", Value::Object(started))
    }

    /// Stop every running member
    pub async fn stop_scheduler(&self) -> CommandResult {
        let running: Vec<_> = self
            .members
            .iter()
            .filter(|m| m.state().is_running())
            .collect();
        let results = join_all(running.iter().map(|m| m.stop_scheduler(None))).await;

        let mut stopped = Map::new();
        for (member, result) in running.iter().zip(results) {
            stopped.insert(member.name().to_string(), result.to_value());
        }
        self.write().state = ScheduleState::Stopped;
        CommandResult::ok("stop_scheduler", Value::Object(stopped))
    }
}

/// Per-device item lists for `device_count` devices
///
/// Non-mosaic items go to every device unchanged.
fn plan_device_items(list: &[ScheduleItem], device_count: usize) -> Vec<Vec<ScheduleItem>> {
    let mut plans = vec![Vec::new(); device_count];
    for item in list {
        let ScheduleAction::StartMosaic(mosaic) = &item.action else {
            for plan in plans.iter_mut() {
                plan.push(item.clone());
            }
            continue;
        };

        match mosaic.federation_mode.unwrap_or_default() {
            FederationMode::Duplicate => {
                for plan in plans.iter_mut() {
                    plan.push(mosaic_item(mosaic.clone()));
                }
            }
            FederationMode::ByTime => {
                let mut share = mosaic.clone();
                share.mosaic.panel_time_sec =
                    (mosaic.mosaic.panel_time_sec / device_count as u64).max(1);
                for plan in plans.iter_mut() {
                    plan.push(mosaic_item(share.clone()));
                }
            }
            FederationMode::ByPanel => {
                let chunks = split_panels(
                    mosaic.mosaic.ra_num,
                    mosaic.mosaic.dec_num,
                    &mosaic.mosaic.selected_panels,
                    device_count,
                );
                for (plan, chunk) in plans.iter_mut().zip(chunks) {
                    if chunk.is_empty() {
                        continue;
                    }
                    let mut share = mosaic.clone();
                    share.mosaic.selected_panels = chunk.join(";");
                    plan.push(mosaic_item(share));
                }
            }
        }
    }
    plans
}

fn mosaic_item(mut mosaic: MosaicItem) -> ScheduleItem {
    mosaic.federation_mode = None;
    ScheduleItem::new(ScheduleAction::StartMosaic(mosaic))
}

/// Divide panel labels among `n` devices
///
/// Each device gets an even contiguous run; the leftover panels go one each
/// to the first devices.
fn split_panels(ra_num: u32, dec_num: u32, selected: &str, n: usize) -> Vec<Vec<String>> {
    let mut labels: Vec<String> = selected
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        for dec in 1..=dec_num {
            for ra in 1..=ra_num {
                labels.push(format!("{}{}", ra, dec));
            }
        }
    }

    let n = n.max(1);
    let base = labels.len() / n;
    let mut chunks: Vec<Vec<String>> = (0..n)
        .map(|i| labels[i * base..(i + 1) * base].to_vec())
        .collect();
    for (i, label) in labels[base * n..].iter().enumerate() {
        chunks[i].push(label.clone());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use seestar_device::testing::{test_config, MockSeestar};
    use seestar_device::{DeviceConfig, SeestarConfig, SeestarSession};
    use std::time::Duration;

    fn mosaic_request(mode: &str) -> Value {
        json!({
            "action": "start_mosaic",
            "params": {
                "target_name": "M42",
                "ra": "5h35m17.3s",
                "dec": "-5d23m28s",
                "panel_time_sec": 300,
                "ra_num": 2,
                "dec_num": 2,
                "federation_mode": mode
            }
        })
    }

    fn mosaic_of(item: &ScheduleItem) -> &MosaicItem {
        match &item.action {
            ScheduleAction::StartMosaic(mosaic) => mosaic,
            other => panic!("expected mosaic, got {:?}", other),
        }
    }

    #[test]
    fn test_split_panels_even_and_leftover() {
        let chunks = split_panels(2, 2, "", 2);
        assert_eq!(chunks, vec![vec!["11", "21"], vec!["12", "22"]]);

        let chunks = split_panels(1, 1, "11;21;31;41;51", 2);
        assert_eq!(chunks, vec![vec!["11", "21", "51"], vec!["31", "41"]]);

        let chunks = split_panels(2, 1, "", 3);
        assert_eq!(
            chunks,
            vec![vec!["11".to_string()], vec!["21".to_string()], vec![]]
        );
    }

    #[test]
    fn test_plan_by_time_divides_panel_time() {
        let item = ScheduleItem::from_request(&mosaic_request("by_time")).unwrap();
        let plans = plan_device_items(&[item], 4);
        assert_eq!(plans.len(), 4);
        for plan in &plans {
            let mosaic = mosaic_of(&plan[0]);
            assert_eq!(mosaic.mosaic.panel_time_sec, 75);
            assert_eq!(mosaic.federation_mode, None);
        }
    }

    #[test]
    fn test_plan_by_panel_skips_idle_devices() {
        let item = ScheduleItem::from_request(&mosaic_request("by_panel")).unwrap();
        let wait = ScheduleItem::new(ScheduleAction::WaitFor { timer_sec: 5 });
        let plans = plan_device_items(&[wait, item], 5);

        let with_mosaic: Vec<_> = plans.iter().filter(|p| p.len() == 2).collect();
        assert_eq!(with_mosaic.len(), 4);
        assert!(plans.iter().all(|p| p[0].action == ScheduleAction::WaitFor { timer_sec: 5 }));
        assert_eq!(mosaic_of(&plans[0][1]).mosaic.selected_panels, "11");
        assert_eq!(plans[4].len(), 1);
    }

    #[test]
    fn test_plan_duplicate_is_default() {
        let mut request = mosaic_request("duplicate");
        request["params"].as_object_mut().unwrap().remove("federation_mode");
        let item = ScheduleItem::from_request(&request).unwrap();
        let plans = plan_device_items(&[item], 2);
        for plan in &plans {
            let mosaic = mosaic_of(&plan[0]);
            assert_eq!(mosaic.mosaic.panel_time_sec, 300);
            assert!(mosaic.mosaic.selected_panels.is_empty());
        }
        assert_ne!(plans[0][0].id, plans[1][0].id);
    }

    #[tokio::test]
    async fn test_start_needs_items_and_devices() {
        let session = SeestarSession::new(DeviceConfig::default(), &SeestarConfig::default());
        let federation = Federation::new(vec![DeviceScheduler::new(session)]);

        let result = federation.start_scheduler(FederationStartRequest::default());
        assert_eq!(result.code, -1);
        assert_eq!(result.result, "Schedule is empty.");

        assert_eq!(federation.queue_mosaic_job(&mosaic_request("by_panel")["params"]).unwrap(), 1);
        let result = federation.start_scheduler(FederationStartRequest::default());
        assert_eq!(result.code, -1);
        assert_eq!(result.result, "No available devices.");

        let view = federation.get_schedule();
        assert_eq!(view.job_queue.len(), 1);
        assert!(view.list.is_empty());
        assert!(view.available_devices.is_empty());
        assert_eq!(view.state, ScheduleState::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_while_working_is_refused() {
        let mock = MockSeestar::start().await;
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);
        let federation = Federation::new(vec![DeviceScheduler::new(session)]);
        federation
            .add_schedule_item(&json!({"action": "wait_for", "params": {"timer_sec": 600}}))
            .unwrap();
        federation.queue_mosaic_job(&mosaic_request("duplicate")["params"]).unwrap();

        assert!(federation.start_scheduler(FederationStartRequest::default()).is_ok());
        let view = federation.get_schedule();
        assert!(view.job_queue.is_empty());
        assert_eq!(view.list.len(), 2);
        assert_eq!(view.devices["Mock Seestar"].list.len(), 2);

        let again = federation.start_scheduler(FederationStartRequest::default());
        assert_eq!(again.code, -1);
        assert_eq!(again.result, ACTIVE_MESSAGE);
        assert_eq!(federation.get_schedule().devices["Mock Seestar"].list.len(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        federation.stop_scheduler().await;
        federation.members()[0].session().end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_fan_out_and_stop() {
        let first = MockSeestar::start().await;
        let second = MockSeestar::start().await;
        let mut members = Vec::new();
        for mock in [&first, &second] {
            let session = SeestarSession::new(mock.device_config(), &test_config());
            assert!(session.start_watch_thread().await);
            members.push(DeviceScheduler::new(session));
        }
        let federation = Federation::new(members);
        federation
            .add_schedule_item(&json!({"action": "wait_for", "params": {"timer_sec": 600}}))
            .unwrap();

        let result = federation.start_scheduler(FederationStartRequest {
            max_devices: Some(1),
        });
        assert!(result.is_ok());
        assert_eq!(result.result.as_object().unwrap().len(), 1);
        assert_eq!(federation.get_schedule().state, ScheduleState::Working);
        assert_eq!(federation.get_schedule().available_devices.len(), 1);

        let fed_item = federation.get_schedule().list[0].id.clone();
        let running = federation
            .members()
            .iter()
            .find(|m| m.state().is_running())
            .unwrap()
            .get_schedule();
        assert_ne!(running.list[0].id, fed_item);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stopped = federation.stop_scheduler().await;
        assert_eq!(stopped.result.as_object().unwrap().len(), 1);
        for member in federation.members() {
            assert!(!member.state().is_running());
            member.session().end_watch_thread().await;
        }
    }
}
