//! # CINDER Test Framework
//!
//! An in-memory fake of the kernel driver, implementing [`Transport`].
//!
//! [`MockTransport`] keeps buffer objects, handles, global names, exported
//! descriptors, submissions and fences in a shared table. Clones share the
//! table, so a test can hand one clone to a device and keep another to
//! inspect call counters, flip buffers busy, inject failures or retire
//! fences.
//!
//! By default every submission retires immediately. With
//! [`MockTransport::set_auto_retire`] turned off, submitted fences stay
//! pending and every referenced buffer is busy until
//! [`MockTransport::retire_all`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cinder_core::transport::{PERF_DOMAIN_END, PERF_SIGNAL_END};
use cinder_core::{
    BoFlags, BoHandle, CpuPrepOp, Descriptor, Errno, GlobalName, GpuParam, Mapping,
    PerfDomainDesc, PerfSignalDesc, SubmitBo, SubmitFlags, SubmitPmr, SubmitReloc,
    SubmitRequest, SubmitResponse, Timestamp, Transport, TransportResult,
};
use hashbrown::HashMap;
use spin::Mutex;

/// Model reported for core 0
pub const MOCK_MODEL: u64 = 0x7000;
/// Revision reported for core 0
pub const MOCK_REVISION: u64 = 0x6214;

// =============================================================================
// RECORDED STATE
// =============================================================================

/// One submission as seen by the fake kernel
#[derive(Debug, Clone)]
pub struct RecordedSubmit {
    /// GPU core
    pub core: u32,
    /// Pipe id
    pub pipe: u32,
    /// Submission flags
    pub flags: SubmitFlags,
    /// Buffer table
    pub bos: Vec<SubmitBo>,
    /// Relocation table
    pub relocs: Vec<SubmitReloc>,
    /// Perf table
    pub pmrs: Vec<SubmitPmr>,
    /// Command words
    pub stream: Vec<u32>,
    /// In-fence descriptor
    pub in_fence: Option<Descriptor>,
    /// Fence handed back
    pub fence: Timestamp,
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `bo_new` calls
    pub bo_new: u64,
    /// `bo_open_name` calls
    pub bo_open_name: u64,
    /// `bo_import` calls
    pub bo_import: u64,
    /// `bo_close` calls
    pub bo_close: u64,
    /// `bo_map` calls
    pub bo_map: u64,
    /// `bo_unmap` calls
    pub bo_unmap: u64,
    /// `bo_flink` calls
    pub bo_flink: u64,
    /// `bo_export` calls
    pub bo_export: u64,
    /// `bo_cpu_prep` calls
    pub bo_cpu_prep: u64,
    /// `submit` calls
    pub submit: u64,
    /// `wait_fence` calls
    pub wait_fence: u64,
    /// `duplicate` calls
    pub duplicate: u64,
    /// `close` calls
    pub close: u64,
}

#[derive(Debug)]
struct MockObject {
    size: u64,
    flags: BoFlags,
    data: Box<[u8]>,
    busy: bool,
    name: Option<u32>,
    exports: u32,
}

#[derive(Debug, Default)]
struct Failures {
    bo_new: Option<Errno>,
    import: Option<Errno>,
    map: Option<Errno>,
    submit: Option<Errno>,
}

#[derive(Debug)]
struct MockState {
    next_object: u32,
    next_handle: u32,
    next_name: u32,
    next_fd: i32,
    objects: HashMap<u32, MockObject>,
    handles: HashMap<u32, u32>,
    names: HashMap<u32, u32>,
    descriptors: HashMap<i32, u32>,
    params: HashMap<(u32, u32), u64>,
    perf_domains: Vec<(String, Vec<String>)>,
    next_fence: u32,
    completed_fence: u32,
    auto_retire: bool,
    submits: Vec<RecordedSubmit>,
    counts: CallCounts,
    fail_next: Failures,
}

impl MockState {
    fn new() -> Self {
        let mut params = HashMap::new();
        params.insert((0, GpuParam::Model.raw()), MOCK_MODEL);
        params.insert((0, GpuParam::Revision.raw()), MOCK_REVISION);
        params.insert((0, GpuParam::Features0.raw()), 0xe0287cad);
        params.insert((0, GpuParam::Features1.raw()), 0xc1799eff);
        params.insert((0, GpuParam::StreamCount.raw()), 16);
        params.insert((0, GpuParam::ShaderCoreCount.raw()), 4);

        Self {
            next_object: 1,
            next_handle: 1,
            next_name: 1,
            next_fd: 100,
            objects: HashMap::new(),
            handles: HashMap::new(),
            names: HashMap::new(),
            descriptors: HashMap::new(),
            params,
            perf_domains: vec![
                ("HI".to_string(), vec!["TOTAL_CYCLES".to_string(), "IDLE_CYCLES".to_string()]),
                ("PE".to_string(), vec!["PIXEL_COUNT_KILLED_BY_COLOR_PIPE".to_string()]),
            ],
            next_fence: 1,
            completed_fence: 0,
            auto_retire: true,
            submits: Vec::new(),
            counts: CallCounts::default(),
            fail_next: Failures::default(),
        }
    }

    fn new_handle(&mut self, object: u32) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, object);
        handle
    }

    fn object_of(&self, handle: BoHandle) -> TransportResult<u32> {
        self.handles.get(&handle.raw()).copied().ok_or(Errno::ENOENT)
    }

    fn object(&mut self, handle: BoHandle) -> TransportResult<&mut MockObject> {
        let id = self.object_of(handle)?;
        self.objects.get_mut(&id).ok_or(Errno::ENOENT)
    }

    fn reap_object(&mut self, id: u32) {
        let referenced = self.handles.values().any(|&o| o == id);
        let exported = self.objects.get(&id).is_some_and(|o| o.exports > 0);
        if !referenced && !exported {
            if let Some(obj) = self.objects.remove(&id) {
                if let Some(name) = obj.name {
                    self.names.remove(&name);
                }
            }
        }
    }
}

// =============================================================================
// MOCK TRANSPORT
// =============================================================================

/// In-memory fake kernel
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    closed: Arc<AtomicBool>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Fake kernel with one GPU core, no softpin
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fake kernel whose core 0 accepts user-assigned addresses from `start`
    pub fn with_softpin(start: u64) -> Self {
        let mock = Self::new();
        mock.set_param(0, GpuParam::SoftpinStartAddr, start);
        mock
    }

    /// Set a parameter reported by `query_param`
    pub fn set_param(&self, core: u32, param: GpuParam, value: u64) {
        self.state.lock().params.insert((core, param.raw()), value);
    }

    /// Mark the object behind `handle` busy or idle
    pub fn set_busy(&self, handle: BoHandle, busy: bool) {
        if let Ok(obj) = self.state.lock().object(handle) {
            obj.busy = busy;
        }
    }

    /// Whether submissions retire immediately
    pub fn set_auto_retire(&self, auto_retire: bool) {
        self.state.lock().auto_retire = auto_retire;
    }

    /// Complete every submitted fence and idle every buffer
    pub fn retire_all(&self) {
        let mut state = self.state.lock();
        state.completed_fence = state.next_fence - 1;
        for obj in state.objects.values_mut() {
            obj.busy = false;
        }
    }

    /// Fail the next `bo_new` with `errno`
    pub fn fail_next_alloc(&self, errno: Errno) {
        self.state.lock().fail_next.bo_new = Some(errno);
    }

    /// Fail the next `bo_open_name` / `bo_import` with `errno`
    pub fn fail_next_import(&self, errno: Errno) {
        self.state.lock().fail_next.import = Some(errno);
    }

    /// Fail the next `bo_map` with `errno`
    pub fn fail_next_map(&self, errno: Errno) {
        self.state.lock().fail_next.map = Some(errno);
    }

    /// Fail the next `submit` with `errno`
    pub fn fail_next_submit(&self, errno: Errno) {
        self.state.lock().fail_next.submit = Some(errno);
    }

    /// Call counters so far
    pub fn counts(&self) -> CallCounts {
        self.state.lock().counts
    }

    /// Every submission so far
    pub fn submits(&self) -> Vec<RecordedSubmit> {
        self.state.lock().submits.clone()
    }

    /// Number of open kernel handles
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Whether `handle` is open
    pub fn is_open(&self, handle: BoHandle) -> bool {
        self.state.lock().handles.contains_key(&handle.raw())
    }

    /// Whether this transport instance was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Create an object owned by "another process", returning its global name
    pub fn create_foreign(&self, size: u64) -> GlobalName {
        let mut state = self.state.lock();
        let id = state.next_object;
        state.next_object += 1;
        let name = state.next_name;
        state.next_name += 1;
        state.objects.insert(id, MockObject {
            size,
            flags: BoFlags::WC,
            data: vec![0u8; size as usize].into_boxed_slice(),
            busy: false,
            name: Some(name),
            exports: 1,
        });
        state.names.insert(name, id);
        GlobalName::new(name)
    }

    /// Export an object owned by "another process" as a descriptor
    pub fn create_foreign_descriptor(&self, size: u64) -> Descriptor {
        let mut state = self.state.lock();
        let id = state.next_object;
        state.next_object += 1;
        let fd = state.next_fd;
        state.next_fd += 1;
        state.objects.insert(id, MockObject {
            size,
            flags: BoFlags::WC,
            data: vec![0u8; size as usize].into_boxed_slice(),
            busy: false,
            name: None,
            exports: 1,
        });
        state.descriptors.insert(fd, id);
        Descriptor::new(fd)
    }

    /// Flags the object behind `handle` was allocated with
    pub fn flags_of(&self, handle: BoHandle) -> Option<BoFlags> {
        self.state.lock().object(handle).ok().map(|o| o.flags)
    }
}

impl Transport for MockTransport {
    fn bo_new(&self, size: u64, flags: BoFlags) -> TransportResult<BoHandle> {
        let mut state = self.state.lock();
        state.counts.bo_new += 1;
        if let Some(errno) = state.fail_next.bo_new.take() {
            return Err(errno);
        }
        if size == 0 {
            return Err(Errno::EINVAL);
        }

        let id = state.next_object;
        state.next_object += 1;
        state.objects.insert(id, MockObject {
            size,
            flags,
            data: vec![0u8; size as usize].into_boxed_slice(),
            busy: false,
            name: None,
            exports: 0,
        });
        Ok(BoHandle::new(state.new_handle(id)))
    }

    fn bo_open_name(&self, name: GlobalName) -> TransportResult<(BoHandle, u64)> {
        let mut state = self.state.lock();
        state.counts.bo_open_name += 1;
        if let Some(errno) = state.fail_next.import.take() {
            return Err(errno);
        }

        let id = *state.names.get(&name.raw()).ok_or(Errno::ENOENT)?;
        let size = state.objects.get(&id).ok_or(Errno::ENOENT)?.size;
        // Opening by name always hands out a fresh handle.
        Ok((BoHandle::new(state.new_handle(id)), size))
    }

    fn bo_import(&self, descriptor: Descriptor) -> TransportResult<(BoHandle, u64)> {
        let mut state = self.state.lock();
        state.counts.bo_import += 1;
        if let Some(errno) = state.fail_next.import.take() {
            return Err(errno);
        }

        let id = *state.descriptors.get(&descriptor.raw()).ok_or(Errno::EBADF)?;
        let size = state.objects.get(&id).ok_or(Errno::EBADF)?.size;
        let existing = state
            .handles
            .iter()
            .find(|&(_, &o)| o == id)
            .map(|(&h, _)| h);
        let handle = match existing {
            Some(h) => h,
            None => state.new_handle(id),
        };
        Ok((BoHandle::new(handle), size))
    }

    fn bo_close(&self, handle: BoHandle) {
        let mut state = self.state.lock();
        state.counts.bo_close += 1;
        if let Some(id) = state.handles.remove(&handle.raw()) {
            state.reap_object(id);
        }
    }

    fn bo_mmap_offset(&self, handle: BoHandle) -> TransportResult<u64> {
        let state = self.state.lock();
        state.object_of(handle)?;
        Ok(u64::from(handle.raw()) << 12)
    }

    fn bo_map(&self, handle: BoHandle, _offset: u64, size: u64) -> TransportResult<Mapping> {
        let mut state = self.state.lock();
        state.counts.bo_map += 1;
        if let Some(errno) = state.fail_next.map.take() {
            return Err(errno);
        }

        let obj = state.object(handle)?;
        if size > obj.size {
            return Err(Errno::EINVAL);
        }
        let ptr = core::ptr::NonNull::new(obj.data.as_mut_ptr()).ok_or(Errno::ENOMEM)?;
        Ok(Mapping::new(ptr, size as usize))
    }

    fn bo_unmap(&self, _mapping: Mapping) {
        self.state.lock().counts.bo_unmap += 1;
    }

    fn bo_flink(&self, handle: BoHandle) -> TransportResult<GlobalName> {
        let mut state = self.state.lock();
        state.counts.bo_flink += 1;
        let id = state.object_of(handle)?;
        if let Some(name) = state.objects.get(&id).and_then(|o| o.name) {
            return Ok(GlobalName::new(name));
        }

        let name = state.next_name;
        state.next_name += 1;
        state.names.insert(name, id);
        if let Some(obj) = state.objects.get_mut(&id) {
            obj.name = Some(name);
        }
        Ok(GlobalName::new(name))
    }

    fn bo_export(&self, handle: BoHandle) -> TransportResult<Descriptor> {
        let mut state = self.state.lock();
        state.counts.bo_export += 1;
        let id = state.object_of(handle)?;
        let fd = state.next_fd;
        state.next_fd += 1;
        state.descriptors.insert(fd, id);
        if let Some(obj) = state.objects.get_mut(&id) {
            obj.exports += 1;
        }
        Ok(Descriptor::new(fd))
    }

    fn bo_cpu_prep(
        &self,
        handle: BoHandle,
        op: CpuPrepOp,
        _timeout: Duration,
    ) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.counts.bo_cpu_prep += 1;
        let obj = state.object(handle)?;
        if obj.busy {
            if op.contains(CpuPrepOp::NOSYNC) {
                return Err(Errno::EBUSY);
            }
            // A blocking prepare "waits" for the GPU to let go.
            obj.busy = false;
        }
        Ok(())
    }

    fn bo_cpu_fini(&self, handle: BoHandle) -> TransportResult<()> {
        self.state.lock().object_of(handle).map(|_| ())
    }

    fn query_param(&self, core: u32, param: GpuParam) -> TransportResult<u64> {
        self.state
            .lock()
            .params
            .get(&(core, param.raw()))
            .copied()
            .ok_or(Errno::EINVAL)
    }

    fn submit(&self, request: &SubmitRequest<'_>) -> TransportResult<SubmitResponse> {
        let mut state = self.state.lock();
        state.counts.submit += 1;
        if let Some(errno) = state.fail_next.submit.take() {
            return Err(errno);
        }
        for bo in request.bos {
            state.object_of(bo.handle())?;
        }
        for reloc in request.relocs {
            if reloc.reloc_idx as usize >= request.bos.len()
                || reloc.submit_offset as usize >= request.stream_bytes().len()
            {
                return Err(Errno::EINVAL);
            }
        }

        let fence = state.next_fence;
        state.next_fence += 1;
        if state.auto_retire {
            state.completed_fence = fence;
        } else {
            for bo in request.bos {
                if let Ok(obj) = state.object(bo.handle()) {
                    obj.busy = true;
                }
            }
        }

        let out_fence = if request.flags.contains(SubmitFlags::FENCE_FD_OUT) {
            let fd = state.next_fd;
            state.next_fd += 1;
            Some(Descriptor::new(fd))
        } else {
            None
        };

        state.submits.push(RecordedSubmit {
            core: request.core,
            pipe: request.pipe.raw(),
            flags: request.flags,
            bos: request.bos.to_vec(),
            relocs: request.relocs.to_vec(),
            pmrs: request.pmrs.to_vec(),
            stream: request.stream.to_vec(),
            in_fence: request.in_fence,
            fence: Timestamp::new(fence),
        });

        Ok(SubmitResponse {
            fence: Timestamp::new(fence),
            out_fence,
        })
    }

    fn wait_fence(&self, _core: u32, fence: Timestamp, _timeout: Duration) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.counts.wait_fence += 1;
        if fence.is_before_or_at(Timestamp::new(state.completed_fence)) {
            Ok(())
        } else {
            Err(Errno::ETIMEDOUT)
        }
    }

    fn perfmon_domain(&self, _core: u32, _pipe: u32, iter: u8) -> TransportResult<PerfDomainDesc> {
        let state = self.state.lock();
        let (name, signals) = state.perf_domains.get(iter as usize).ok_or(Errno::EINVAL)?;
        let next = if (iter as usize) + 1 < state.perf_domains.len() {
            iter + 1
        } else {
            PERF_DOMAIN_END
        };
        Ok(PerfDomainDesc {
            id: iter,
            nr_signals: signals.len() as u16,
            name: name.clone(),
            next,
        })
    }

    fn perfmon_signal(
        &self,
        _core: u32,
        _pipe: u32,
        domain: u8,
        iter: u16,
    ) -> TransportResult<PerfSignalDesc> {
        let state = self.state.lock();
        let (_, signals) = state.perf_domains.get(domain as usize).ok_or(Errno::EINVAL)?;
        let name = signals.get(iter as usize).ok_or(Errno::EINVAL)?;
        let next = if (iter as usize) + 1 < signals.len() {
            iter + 1
        } else {
            PERF_SIGNAL_END
        };
        Ok(PerfSignalDesc {
            id: iter,
            name: name.clone(),
            next,
        })
    }

    fn duplicate(&self) -> TransportResult<Self> {
        self.state.lock().counts.duplicate += 1;
        Ok(Self {
            state: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn close(&self) {
        self.state.lock().counts.close += 1;
        self.closed.store(true, Ordering::Release);
    }
}
