use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// Identifies the App that owns a loop resource. Every timer, in-flight
/// fetch and pending sink is tagged with one so callbacks only ever fire
/// inside the engine and context that created them.
pub type AppId = u32;

/// Wrapper type for loop resource identification.
pub type Index = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Oneshot,
    Repeating,
}

/// Describes a timer resource.
struct TimerWrap {
    owner: AppId,
    kind: TimerKind,
    delay: Duration,
    cb: v8::Global<v8::Function>,
    active: bool,
}

/// A timer that came due and should be fired by the caller.
pub struct DueTimer {
    pub id: Index,
    pub cb: v8::Global<v8::Function>,
}

/// Outcome of an outbound HTTP task, shipped from a worker thread.
/// The success side carries bincode-encoded [`FetchResponse`] bytes.
pub struct FetchCompletion {
    pub id: Index,
    pub result: Result<Vec<u8>, FetchFailure>,
}

#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Shared between an in-flight fetch worker and the abort binding. The
/// worker checks the flag around its blocking roundtrip; the reason name
/// becomes the rejection's error name ("AbortError" or "TimeoutError").
#[derive(Debug, Default)]
pub struct AbortState {
    pub aborted: AtomicBool,
    pub reason: Mutex<String>,
}

impl AbortState {
    pub fn abort(&self, reason: &str) {
        *self.reason.lock().unwrap() = reason.into();
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> Option<String> {
        if self.aborted.load(Ordering::SeqCst) {
            let reason = self.reason.lock().unwrap().clone();
            Some(if reason.is_empty() {
                "AbortError".into()
            } else {
                reason
            })
        } else {
            None
        }
    }
}

/// The resolver half of a dispatched fetch, kept on the loop thread until
/// the completion arrives.
struct FetchWrap {
    owner: AppId,
    resolver: v8::Global<v8::PromiseResolver>,
}

/// A WritableStream sink promise being watched for settlement.
struct SinkWrap {
    id: Index,
    owner: AppId,
    stream_id: Index,
    sink: v8::Global<v8::Promise>,
    resolver: v8::Global<v8::PromiseResolver>,
}

/// A sink whose promise should be inspected by the caller.
pub struct PendingSink {
    pub id: Index,
    pub stream_id: Index,
    pub sink: v8::Global<v8::Promise>,
    pub resolver: v8::Global<v8::PromiseResolver>,
}

type Task = Box<dyn FnOnce() -> Result<Vec<u8>, FetchFailure> + Send>;

/// The cooperative core shared by every App in the process. Lives on the
/// main thread; worker threads only ever touch the completion sender and
/// the atomic in-flight counter.
pub struct EventLoop {
    next_index: Index,
    timers: HashMap<Index, TimerWrap>,
    // Ordered by absolute due time; the id in the key breaks ties in
    // insertion order since ids are monotonic.
    timer_queue: BTreeMap<(Instant, Index), Index>,
    fetches: HashMap<Index, FetchWrap>,
    aborts: HashMap<Index, Arc<AbortState>>,
    fetch_inbox: HashMap<AppId, Vec<FetchCompletion>>,
    fetches_in_flight: Arc<AtomicUsize>,
    completion_queue: mpsc::Receiver<FetchCompletion>,
    completion_dispatcher: Arc<Mutex<mpsc::Sender<FetchCompletion>>>,
    sinks: Vec<SinkWrap>,
    thread_pool: ThreadPool,
}

impl EventLoop {
    /// Creates a new event-loop instance.
    pub fn new(num_threads: usize) -> Self {
        // Number of threads should always be a positive non-zero number.
        assert!(num_threads > 0);

        let (completion_dispatcher, completion_queue) = mpsc::channel();

        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();

        EventLoop {
            next_index: 1,
            timers: HashMap::new(),
            timer_queue: BTreeMap::new(),
            fetches: HashMap::new(),
            aborts: HashMap::new(),
            fetch_inbox: HashMap::new(),
            fetches_in_flight: Arc::new(AtomicUsize::new(0)),
            completion_queue,
            completion_dispatcher: Arc::new(Mutex::new(completion_dispatcher)),
            sinks: Vec::new(),
            thread_pool,
        }
    }

    /// Returns the next available resource index. Indexes are monotonic
    /// for the lifetime of the process and never reused.
    fn index(&mut self) -> Index {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Returns if the given App still has live asynchronous work: an
    /// active timer, an unresolved fetch, or a pending stream sink.
    pub fn has_pending_work(&mut self, owner: AppId) -> bool {
        self.pump_completions();

        let timers = self
            .timers
            .values()
            .any(|timer| timer.owner == owner && timer.active);
        let fetches = self.fetches.values().any(|fetch| fetch.owner == owner);
        let parked = self.fetch_inbox.get(&owner).map_or(false, |inbox| !inbox.is_empty());
        let sinks = self.sinks.iter().any(|sink| sink.owner == owner);

        timers || fetches || parked || sinks
    }

    /// Lets worker threads make progress before the next poll.
    pub fn pause(&self) {
        thread::sleep(Duration::from_millis(1));
    }
}

//---------------------------------------------------------
//  TIMERS.
//---------------------------------------------------------

impl EventLoop {
    /// Schedules a new timer owned by the given App.
    pub fn create_timer(
        &mut self,
        owner: AppId,
        delay_ms: u64,
        kind: TimerKind,
        cb: v8::Global<v8::Function>,
    ) -> Index {
        let index = self.index();
        let delay = Duration::from_millis(delay_ms);

        let timer = TimerWrap {
            owner,
            kind,
            delay,
            cb,
            active: true,
        };

        self.timer_queue.insert((Instant::now() + delay, index), index);
        self.timers.insert(index, timer);

        index
    }

    /// Marks a timer as cancelled. The queue entry stays in place and is
    /// skipped (and freed) when it comes due.
    pub fn remove_timer(&mut self, index: Index) {
        if let Some(timer) = self.timers.get_mut(&index) {
            timer.active = false;
        }
    }

    /// Collects every timer of the given App whose due time has passed.
    /// One-shots are freed, repeating timers are re-armed with a fresh
    /// absolute target so a busy loop can never schedule into the past.
    /// Due timers of other Apps stay queued untouched.
    pub fn poll_due_timers(&mut self, owner: AppId) -> Vec<DueTimer> {
        let now = Instant::now();

        let due: Vec<(Instant, Index)> = self
            .timer_queue
            .range(..(now, Index::MAX))
            .map(|(key, _)| *key)
            .filter(|(_, index)| {
                self.timers
                    .get(index)
                    .map(|timer| timer.owner == owner)
                    .unwrap_or(true)
            })
            .collect();

        let mut completed = Vec::new();

        for key in due {
            let index = match self.timer_queue.remove(&key) {
                Some(index) => index,
                None => continue,
            };

            let timer = match self.timers.get(&index) {
                Some(timer) => timer,
                None => continue,
            };

            // Cancelled entries are dropped without firing.
            if !timer.active {
                self.timers.remove(&index);
                continue;
            }

            match timer.kind {
                TimerKind::Oneshot => {
                    let timer = self.timers.remove(&index).unwrap();
                    completed.push(DueTimer {
                        id: index,
                        cb: timer.cb,
                    });
                }
                TimerKind::Repeating => {
                    let rearm = (Instant::now() + timer.delay, index);
                    self.timer_queue.insert(rearm, index);
                    completed.push(DueTimer {
                        id: index,
                        cb: timer.cb.clone(),
                    });
                }
            }
        }

        completed
    }
}

//---------------------------------------------------------
//  OUTBOUND FETCHES.
//---------------------------------------------------------

impl EventLoop {
    /// Registers the resolver of a dispatched fetch and returns its id
    /// together with the abort state its worker will observe.
    pub fn register_fetch(
        &mut self,
        owner: AppId,
        resolver: v8::Global<v8::PromiseResolver>,
    ) -> (Index, Arc<AbortState>) {
        let index = self.index();
        let abort = Arc::new(AbortState::default());

        self.fetches.insert(index, FetchWrap { owner, resolver });
        self.aborts.insert(index, abort.clone());

        (index, abort)
    }

    /// Flags an in-flight fetch as aborted. A completion may already be
    /// queued, in which case this is a no-op by design of the JS side.
    pub fn abort_fetch(&mut self, index: Index, reason: &str) {
        if let Some(abort) = self.aborts.get(&index) {
            abort.abort(reason);
        }
    }

    /// Spawns the blocking half of a fetch onto the worker pool. The task
    /// posts its completion on the shared queue and decrements the
    /// in-flight counter; it never touches engine state.
    pub fn spawn_fetch(&mut self, index: Index, task: Task) {
        let dispatcher = self.completion_dispatcher.clone();
        let in_flight = self.fetches_in_flight.clone();

        in_flight.fetch_add(1, Ordering::SeqCst);

        self.thread_pool.spawn(move || {
            let result = task();
            let completion = FetchCompletion { id: index, result };

            // The receiving half outlives every worker except at process
            // teardown, where losing the completion is fine.
            let _ = dispatcher.lock().unwrap().send(completion);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Drains the cross-thread queue, parking each completion in the inbox
    /// of the App that owns it.
    fn pump_completions(&mut self) {
        while let Ok(completion) = self.completion_queue.try_recv() {
            let owner = match self.fetches.get(&completion.id) {
                Some(fetch) => fetch.owner,
                None => continue,
            };
            self.fetch_inbox.entry(owner).or_default().push(completion);
        }
    }

    /// Takes every arrived completion owned by the given App, paired with
    /// its promise resolver. The resolver registry entry is released here.
    pub fn take_fetch_completions(
        &mut self,
        owner: AppId,
    ) -> Vec<(FetchCompletion, v8::Global<v8::PromiseResolver>)> {
        self.pump_completions();

        self.fetch_inbox
            .remove(&owner)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|completion| {
                self.aborts.remove(&completion.id);
                self.fetches
                    .remove(&completion.id)
                    .map(|fetch| (completion, fetch.resolver))
            })
            .collect()
    }
}

//---------------------------------------------------------
//  ASYNC STREAM SINKS.
//---------------------------------------------------------

impl EventLoop {
    /// Starts watching a sink promise for settlement.
    pub fn register_sink(
        &mut self,
        owner: AppId,
        stream_id: Index,
        sink: v8::Global<v8::Promise>,
        resolver: v8::Global<v8::PromiseResolver>,
    ) -> Index {
        let index = self.index();
        self.sinks.push(SinkWrap {
            id: index,
            owner,
            stream_id,
            sink,
            resolver,
        });
        index
    }

    /// Returns handle clones for every sink of the given App so the caller
    /// can inspect promise state inside the right context. The reported id
    /// is the sink's own stable index, valid across owners.
    pub fn pending_sinks(&self, owner: AppId) -> Vec<PendingSink> {
        self.sinks
            .iter()
            .filter(|sink| sink.owner == owner)
            .map(|sink| PendingSink {
                id: sink.id,
                stream_id: sink.stream_id,
                sink: sink.sink.clone(),
                resolver: sink.resolver.clone(),
            })
            .collect()
    }

    /// Removes settled sinks by the ids reported from `pending_sinks`.
    pub fn remove_sinks(&mut self, owner: AppId, settled: &[Index]) {
        self.sinks
            .retain(|sink| sink.owner != owner || !settled.contains(&sink.id));
    }

    /// Drops every resource owned by an App that is being torn down. The
    /// persistent handles inside must be released before the isolate dies.
    pub fn release_app(&mut self, owner: AppId) {
        self.pump_completions();
        self.timers.retain(|_, timer| timer.owner != owner);

        let timers = &self.timers;
        self.timer_queue.retain(|_, index| timers.contains_key(index));

        let fetches = &self.fetches;
        self.aborts.retain(|index, _| {
            fetches
                .get(index)
                .map(|fetch| fetch.owner != owner)
                .unwrap_or(false)
        });
        self.fetches.retain(|_, fetch| fetch.owner != owner);
        self.fetch_inbox.remove(&owner);
        self.sinks.retain(|sink| sink.owner != owner);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        let default_pool_size = NonZeroUsize::new(4).unwrap();
        let num_cores = thread::available_parallelism().unwrap_or(default_pool_size);

        Self::new(num_cores.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::App;
    use crate::runtime::Host;

    fn noop_callback(app: &mut App) -> v8::Global<v8::Function> {
        let value = app.execute_script("<test>", "(function () {})").unwrap();
        let scope = &mut app.handle_scope();
        let value = v8::Local::new(scope, value);
        let function: v8::Local<v8::Function> = value.try_into().unwrap();
        v8::Global::new(scope, function)
    }

    #[test]
    fn timer_ids_are_monotonic_and_never_reused() {
        let host = Host::new();
        let mut app = host.eval_instance(false);
        let cb = noop_callback(&mut app);
        let mut event_loop = EventLoop::new(1);

        let a = event_loop.create_timer(1, 0, TimerKind::Oneshot, cb.clone());
        let b = event_loop.create_timer(1, 0, TimerKind::Oneshot, cb.clone());
        assert!(b > a);

        thread::sleep(Duration::from_millis(5));
        let due = event_loop.poll_due_timers(1);
        assert_eq!(due.len(), 2);

        // Ids keep climbing after earlier timers fired and were freed.
        let c = event_loop.create_timer(1, 0, TimerKind::Oneshot, cb);
        assert!(c > b);
    }

    #[test]
    fn due_timers_fire_shortest_delay_first_then_insertion_order() {
        let host = Host::new();
        let mut app = host.eval_instance(false);
        let cb = noop_callback(&mut app);
        let mut event_loop = EventLoop::new(1);

        let first = event_loop.create_timer(1, 2, TimerKind::Oneshot, cb.clone());
        let second = event_loop.create_timer(1, 2, TimerKind::Oneshot, cb.clone());
        let later = event_loop.create_timer(1, 30, TimerKind::Oneshot, cb);

        thread::sleep(Duration::from_millis(10));
        let due: Vec<Index> = event_loop.poll_due_timers(1).iter().map(|t| t.id).collect();

        // Same due time resolves by insertion order; the 30ms timer is
        // still pending.
        assert_eq!(due, vec![first, second]);
        assert!(event_loop.has_pending_work(1));

        thread::sleep(Duration::from_millis(30));
        let due: Vec<Index> = event_loop.poll_due_timers(1).iter().map(|t| t.id).collect();
        assert_eq!(due, vec![later]);
        assert!(!event_loop.has_pending_work(1));
    }

    #[test]
    fn cancelled_timers_are_skipped_and_freed() {
        let host = Host::new();
        let mut app = host.eval_instance(false);
        let cb = noop_callback(&mut app);
        let mut event_loop = EventLoop::new(1);

        let id = event_loop.create_timer(1, 0, TimerKind::Oneshot, cb);
        event_loop.remove_timer(id);

        thread::sleep(Duration::from_millis(5));
        assert!(event_loop.poll_due_timers(1).is_empty());
        assert!(!event_loop.has_pending_work(1));
    }

    #[test]
    fn repeating_timers_rearm_with_a_fresh_target() {
        let host = Host::new();
        let mut app = host.eval_instance(false);
        let cb = noop_callback(&mut app);
        let mut event_loop = EventLoop::new(1);

        event_loop.create_timer(1, 1, TimerKind::Repeating, cb);

        thread::sleep(Duration::from_millis(5));
        assert_eq!(event_loop.poll_due_timers(1).len(), 1);
        // Re-armed for the future, so an immediate poll finds nothing.
        assert!(event_loop.poll_due_timers(1).is_empty());
        assert!(event_loop.has_pending_work(1));
    }

    #[test]
    fn timers_fire_only_for_their_owner() {
        let host = Host::new();
        let mut app = host.eval_instance(false);
        let cb = noop_callback(&mut app);
        let mut event_loop = EventLoop::new(1);

        let mine = event_loop.create_timer(1, 0, TimerKind::Oneshot, cb.clone());
        event_loop.create_timer(2, 0, TimerKind::Oneshot, cb);

        thread::sleep(Duration::from_millis(5));
        let due: Vec<Index> = event_loop.poll_due_timers(1).iter().map(|t| t.id).collect();
        assert_eq!(due, vec![mine]);

        // The other App's timer is untouched until its own tick.
        assert!(event_loop.has_pending_work(2));
        assert_eq!(event_loop.poll_due_timers(2).len(), 1);
    }

    #[test]
    fn settled_sinks_are_removed_per_owner_despite_interleaving() {
        let host = Host::new();
        let mut app = host.eval_instance(false);
        let mut event_loop = EventLoop::new(1);

        let (sink, resolver) = {
            let scope = &mut app.handle_scope();
            let resolver = v8::PromiseResolver::new(scope).unwrap();
            let promise = resolver.get_promise(scope);
            (
                v8::Global::new(scope, promise),
                v8::Global::new(scope, resolver),
            )
        };

        // Two owners interleaved in registration order: [A, B, A, B].
        let a1 = event_loop.register_sink(1, 10, sink.clone(), resolver.clone());
        let b1 = event_loop.register_sink(2, 20, sink.clone(), resolver.clone());
        let a2 = event_loop.register_sink(1, 11, sink.clone(), resolver.clone());
        let b2 = event_loop.register_sink(2, 21, sink, resolver);

        let ids: Vec<Index> = event_loop.pending_sinks(1).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a1, a2]);

        event_loop.remove_sinks(1, &ids);
        assert!(event_loop.pending_sinks(1).is_empty());

        let others: Vec<Index> = event_loop.pending_sinks(2).iter().map(|s| s.id).collect();
        assert_eq!(others, vec![b1, b2]);
    }

    #[test]
    fn release_app_drops_every_owned_resource() {
        let host = Host::new();
        let mut app = host.eval_instance(false);
        let cb = noop_callback(&mut app);
        let mut event_loop = EventLoop::new(1);

        event_loop.create_timer(7, 0, TimerKind::Repeating, cb);
        assert!(event_loop.has_pending_work(7));

        event_loop.release_app(7);
        assert!(!event_loop.has_pending_work(7));
        assert!(event_loop.timer_queue.is_empty());
    }
}
