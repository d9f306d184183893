use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use docbus_store::{
    ChangeEvent, ClusterConfig, DocumentMapper, Filter, JsonMapper, Order, Sort, StoreDriver,
    Update,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::correlator::AnswerCorrelator;
use crate::error::Error;
use crate::listener::{ListenerContext, ListenerId, ListenerRegistry, MessageListener};
use crate::message::{Message, OPEN_SENTINEL, fields};

const DEFAULT_PAUSE: Duration = Duration::from_millis(500);
const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_COLLECTION: &str = "msg";

/// How inbound answer records are treated by the poll scan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReceiveAnswers {
    /// Answer records are never fetched or dispatched. Pending
    /// `send_and_await_answers` calls can only time out in this mode.
    None,
    /// Answers to messages this node sent feed the correlator; they reach
    /// listeners only while a waiter is pending.
    #[default]
    OnlyMine,
    /// Every fetched answer also gets dispatched to listeners.
    All,
}

/// Settings for a [`MessagingEngine`].
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Collection the message records live in.
    pub collection: String,
    /// Poll interval between scan cycles.
    pub pause: Duration,
    /// Stable id of this node; stamped as `sender` on outbound records.
    pub node_id: String,
    /// Answer-record policy.
    pub receive_answers: ReceiveAnswers,
    /// Wake the poll loop on store change events in addition to the pause.
    pub use_change_stream: bool,
    /// Bound on draining the in-flight cycle during terminate.
    pub processing_timeout: Duration,
    /// Cluster configuration shared with the monitor.
    pub cluster_config: Arc<ClusterConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            pause: DEFAULT_PAUSE,
            node_id: Uuid::new_v4().to_string(),
            receive_answers: ReceiveAnswers::default(),
            use_change_stream: false,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            cluster_config: Arc::new(ClusterConfig::new(Vec::new())),
        }
    }
}

/// One messaging engine instance per participating node.
///
/// Owns the poll loop, the claim protocol, the listener registry, and the
/// answer correlation table. Many engines operate concurrently against
/// the same store with no coordination beyond the store's atomic
/// conditional updates.
pub struct MessagingEngine<D>
where
    D: StoreDriver,
{
    driver: D,
    mapper: JsonMapper,
    node_id: String,
    collection: String,
    cluster_config: Arc<ClusterConfig>,
    pause: Arc<StdMutex<Duration>>,
    receive_answers: Arc<StdRwLock<ReceiveAnswers>>,
    use_change_stream: Arc<AtomicBool>,
    processing_timeout: Duration,
    listeners: Arc<ListenerRegistry>,
    correlator: Arc<AnswerCorrelator>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<D> Clone for MessagingEngine<D>
where
    D: StoreDriver,
{
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            mapper: self.mapper,
            node_id: self.node_id.clone(),
            collection: self.collection.clone(),
            cluster_config: Arc::clone(&self.cluster_config),
            pause: Arc::clone(&self.pause),
            receive_answers: Arc::clone(&self.receive_answers),
            use_change_stream: Arc::clone(&self.use_change_stream),
            processing_timeout: self.processing_timeout,
            listeners: Arc::clone(&self.listeners),
            correlator: Arc::clone(&self.correlator),
            shutdown_token: self.shutdown_token.clone(),
            task_tracker: self.task_tracker.clone(),
        }
    }
}

impl<D> std::fmt::Debug for MessagingEngine<D>
where
    D: StoreDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingEngine")
            .field("node_id", &self.node_id)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl<D> MessagingEngine<D>
where
    D: StoreDriver,
{
    /// Creates a new engine. The poll loop starts with [`Self::start`].
    #[must_use]
    pub fn new(driver: D, settings: EngineSettings) -> Self {
        info!(
            node_id = %settings.node_id,
            collection = %settings.collection,
            "creating messaging engine"
        );

        Self {
            driver,
            mapper: JsonMapper::new(),
            node_id: settings.node_id,
            collection: settings.collection,
            cluster_config: settings.cluster_config,
            pause: Arc::new(StdMutex::new(settings.pause)),
            receive_answers: Arc::new(StdRwLock::new(settings.receive_answers)),
            use_change_stream: Arc::new(AtomicBool::new(settings.use_change_stream)),
            processing_timeout: settings.processing_timeout,
            listeners: Arc::new(ListenerRegistry::default()),
            correlator: Arc::new(AnswerCorrelator::default()),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// The stable id this engine claims and sends under.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The cluster configuration shared with the monitor.
    #[must_use]
    pub fn cluster_config(&self) -> &Arc<ClusterConfig> {
        &self.cluster_config
    }

    /// Starts the poll loop.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyRunning`] when called twice.
    pub fn start(&self) -> Result<(), Error> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyRunning);
        }

        self.task_tracker.spawn(Self::run_loop(self.clone()));
        self.task_tracker.close();

        info!(node_id = %self.node_id, "messaging engine started");
        Ok(())
    }

    /// Stops the poll loop, draining at most one in-flight cycle.
    ///
    /// Idempotent; returns only once the loop has stopped (or the drain
    /// bound elapsed).
    pub async fn terminate(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();

        if tokio::time::timeout(self.processing_timeout, self.task_tracker.wait())
            .await
            .is_err()
        {
            warn!(
                node_id = %self.node_id,
                "poll loop did not drain within {:?}", self.processing_timeout
            );
        }

        info!(node_id = %self.node_id, "messaging engine terminated");
    }

    /// Sets the poll interval, effective from the next cycle.
    pub fn set_pause(&self, pause: Duration) {
        if let Ok(mut current) = self.pause.lock() {
            *current = pause;
        }
    }

    /// Sets the answer-record policy, effective from the next cycle.
    pub fn set_receive_answers(&self, mode: ReceiveAnswers) {
        if let Ok(mut current) = self.receive_answers.write() {
            *current = mode;
        }
    }

    /// Enables or disables change-feed-driven wake-up.
    ///
    /// When enabled, a cycle is triggered on store change events in
    /// addition to the pause timer; whichever fires first triggers one
    /// cycle.
    pub fn set_use_change_stream(&self, enabled: bool) {
        self.use_change_stream.store(enabled, Ordering::SeqCst);
    }

    /// Registers a handler for every topic.
    pub async fn add_listener(&self, handler: Arc<dyn MessageListener>) -> ListenerId {
        self.listeners.add(None, handler).await
    }

    /// Registers a handler for records whose `name` matches.
    pub async fn add_listener_for(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn MessageListener>,
    ) -> ListenerId {
        self.listeners.add(Some(name.into()), handler).await
    }

    /// Removes a previously registered listener.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id).await
    }

    /// Validates, stamps, and persists a message; returns its id.
    ///
    /// Returns once the record is persisted. Delivery happens through the
    /// consuming nodes' poll loops; this call never waits for it.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for a missing topic name and
    /// [`Error::Store`] when the insert fails after driver retries.
    pub async fn send(&self, mut message: Message) -> Result<Uuid, Error> {
        if message.id.is_nil() {
            message.id = Uuid::new_v4();
        }
        message.sender = self.node_id.clone();
        message.prepare_for_send(Self::now())?;

        let document = self.mapper.serialize(&message)?;
        self.driver
            .insert(&self.collection, document)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;

        debug!(
            node_id = %self.node_id,
            message_id = %message.id,
            name = %message.name,
            "message sent"
        );
        Ok(message.id)
    }

    /// Sends `message` and waits until at least `min_answers` answers
    /// correlated to it arrived or `timeout` elapsed.
    ///
    /// Returns whatever answers arrived in arrival order; fewer than
    /// requested (or none at all) on timeout is not an error. Only the
    /// calling context suspends, never the poll loop.
    ///
    /// # Errors
    /// Same failures as [`Self::send`]; the timeout itself never fails.
    pub async fn send_and_await_answers(
        &self,
        mut message: Message,
        min_answers: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, Error> {
        if message.id.is_nil() {
            message.id = Uuid::new_v4();
        }
        let message_id = message.id;

        let mut receiver = self.correlator.register(message_id);
        if let Err(e) = self.send(message).await {
            self.correlator.deregister(message_id);
            return Err(e);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut answers = Vec::new();
        while answers.len() < min_answers {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(answer)) => answers.push(answer),
                Ok(None) | Err(_) => break,
            }
        }

        self.correlator.deregister(message_id);
        debug!(
            node_id = %self.node_id,
            message_id = %message_id,
            answers = answers.len(),
            "await answers finished"
        );
        Ok(answers)
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn pause_interval(&self) -> Duration {
        self.pause.lock().map(|pause| *pause).unwrap_or(DEFAULT_PAUSE)
    }

    fn receive_answers_mode(&self) -> ReceiveAnswers {
        self.receive_answers
            .read()
            .map(|mode| *mode)
            .unwrap_or_default()
    }

    async fn run_loop(engine: Self) {
        debug!(node_id = %engine.node_id, "poll loop running");
        let mut change_feed: Option<broadcast::Receiver<ChangeEvent>> = None;

        loop {
            engine.run_cycle().await;

            if engine.shutdown_token.is_cancelled() {
                break;
            }

            if engine.use_change_stream.load(Ordering::SeqCst) {
                if change_feed.is_none() {
                    match engine.driver.watch(&engine.collection).await {
                        Ok(receiver) => change_feed = Some(receiver),
                        Err(e) => warn!("change feed unavailable: {e}"),
                    }
                }
            } else {
                change_feed = None;
            }

            tokio::select! {
                biased;
                () = engine.shutdown_token.cancelled() => break,
                () = Self::next_change(&mut change_feed) => {}
                () = tokio::time::sleep(engine.pause_interval()) => {}
            }
        }

        debug!(node_id = %engine.node_id, "poll loop stopped");
    }

    async fn next_change(feed: &mut Option<broadcast::Receiver<ChangeEvent>>) {
        let Some(receiver) = feed.as_mut() else {
            return std::future::pending::<()>().await;
        };
        match receiver.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                *feed = None;
                std::future::pending::<()>().await;
            }
        }
    }

    /// One scan cycle. Driver errors are logged and treated as "no
    /// candidates this cycle".
    async fn run_cycle(&self) {
        let now = Self::now();
        let Some(filter) = self.candidate_filter(now).await else {
            return;
        };
        let sort = Sort::by(fields::PRIORITY, Order::Asc).then(fields::TIMESTAMP, Order::Asc);

        let documents = match self
            .driver
            .find(&self.collection, &filter, &sort, None, 0)
            .await
        {
            Ok(documents) => documents,
            Err(e) => {
                warn!(node_id = %self.node_id, "candidate scan failed: {e}");
                return;
            }
        };

        for document in documents {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            let message: Message = match self.mapper.deserialize(document) {
                Ok(message) => message,
                Err(e) => {
                    warn!(node_id = %self.node_id, "skipping undecodable record: {e}");
                    continue;
                }
            };

            if let Err(e) = self.process_candidate(message, now).await {
                warn!(node_id = %self.node_id, "candidate processing failed: {e}");
            }
        }
    }

    /// The scan filter for this cycle, or `None` when nothing could match
    /// (no listeners and answers disabled).
    async fn candidate_filter(&self, now: i64) -> Option<Filter> {
        let me = Value::from(self.node_id.as_str());
        let name_filter = self.listeners.name_filter().await;
        let mode = self.receive_answers_mode();

        let mut arms = Vec::new();

        // Exclusive candidates: unclaimed and never processed.
        let mut exclusive = vec![
            Filter::Eq(fields::EXCLUSIVE.into(), Value::from(true)),
            Filter::Exists(fields::IN_ANSWER_TO.into(), false),
            Filter::Eq(fields::LOCKED_BY.into(), Value::from(OPEN_SENTINEL)),
            Filter::Exists(fields::PROCESSED_BY.into(), false),
        ];
        // Broadcast candidates: not yet handled by this node.
        let mut broadcast = vec![
            Filter::Eq(fields::EXCLUSIVE.into(), Value::from(false)),
            Filter::Exists(fields::IN_ANSWER_TO.into(), false),
            Filter::Ne(fields::PROCESSED_BY.into(), me.clone()),
        ];

        match name_filter {
            Some(names) if names.is_empty() => {
                // No listeners: claiming anything would just burn records.
            }
            Some(names) => {
                let names: Vec<Value> = names.into_iter().map(Value::from).collect();
                exclusive.push(Filter::In(fields::NAME.into(), names.clone()));
                broadcast.push(Filter::In(fields::NAME.into(), names));
                arms.push(Filter::And(exclusive));
                arms.push(Filter::And(broadcast));
            }
            None => {
                arms.push(Filter::And(exclusive));
                arms.push(Filter::And(broadcast));
            }
        }

        // Own-sent answers, when the policy admits them.
        if mode != ReceiveAnswers::None {
            arms.push(Filter::And(vec![
                Filter::Exists(fields::IN_ANSWER_TO.into(), true),
                Filter::Ne(fields::PROCESSED_BY.into(), me.clone()),
            ]));
        }

        if arms.is_empty() {
            return None;
        }

        Some(Filter::And(vec![
            Filter::Gt(fields::DELETE_AT.into(), Value::from(now)),
            Filter::Ne(fields::SENDER.into(), me.clone()),
            Filter::Or(vec![
                Filter::Exists(fields::RECIPIENTS.into(), false),
                Filter::Eq(fields::RECIPIENTS.into(), me),
            ]),
            Filter::Or(arms),
        ]))
    }

    async fn process_candidate(&self, message: Message, now: i64) -> Result<(), Error> {
        if message.is_answer() {
            return self.process_answer(message).await;
        }

        if message.exclusive {
            if !self.claim(&message, now).await? {
                // Lost the race; some other node owns it now.
                return Ok(());
            }
        } else if !self.mark_processed(&message).await? {
            // Already recorded ourselves in a previous cycle.
            return Ok(());
        }

        let answer = self.dispatch(&message).await;

        if message.exclusive {
            self.mark_processed(&message).await?;
        }

        if let Some(answer) = answer {
            self.send_answer(answer, &message).await?;
        }
        Ok(())
    }

    async fn process_answer(&self, message: Message) -> Result<(), Error> {
        let mode = self.receive_answers_mode();
        if mode == ReceiveAnswers::None {
            return Ok(());
        }

        let consumed = self.correlator.offer(&message);
        let dispatch = match mode {
            ReceiveAnswers::All => true,
            ReceiveAnswers::OnlyMine => consumed,
            ReceiveAnswers::None => false,
        };

        if dispatch {
            // Answers to answers are possible but rare; treated like any
            // other reply.
            if let Some(answer) = self.dispatch(&message).await {
                self.mark_processed(&message).await?;
                return self.send_answer(answer, &message).await;
            }
        }

        self.mark_processed(&message).await?;
        Ok(())
    }

    /// Attempts to acquire exclusive ownership of `message`.
    ///
    /// A single atomic conditional update; exactly one competing node
    /// observes a modified count of one. Losing is not an error.
    async fn claim(&self, message: &Message, now: i64) -> Result<bool, Error> {
        let filter = Filter::And(vec![
            Filter::Eq(fields::ID.into(), Value::from(message.id.to_string())),
            Filter::Eq(fields::LOCKED_BY.into(), Value::from(OPEN_SENTINEL)),
        ]);
        let update = Update::new()
            .set(fields::LOCKED_BY, self.node_id.as_str())
            .set(fields::LOCKED, now);

        let modified = self
            .driver
            .update_one(&self.collection, &filter, &update)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;

        if modified == 1 {
            debug!(
                node_id = %self.node_id,
                message_id = %message.id,
                "claimed exclusive message"
            );
        }
        Ok(modified == 1)
    }

    /// Records this node in `processed_by`; idempotent under races.
    async fn mark_processed(&self, message: &Message) -> Result<bool, Error> {
        let filter = Filter::And(vec![
            Filter::Eq(fields::ID.into(), Value::from(message.id.to_string())),
            Filter::Ne(fields::PROCESSED_BY.into(), Value::from(self.node_id.as_str())),
        ]);
        let update = Update::new().add_to_set(fields::PROCESSED_BY, self.node_id.as_str());

        let modified = self
            .driver
            .update_one(&self.collection, &filter, &update)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(modified == 1)
    }

    /// Dispatches to every matching listener, collecting errors per
    /// handler. The first answer returned wins.
    async fn dispatch(&self, message: &Message) -> Option<Message> {
        let context = ListenerContext {
            node_id: self.node_id.clone(),
        };
        let mut answer = None;

        for handler in self.listeners.matching(&message.name).await {
            match handler.on_message(&context, message.clone()).await {
                Ok(Some(reply)) => {
                    if answer.is_none() {
                        answer = Some(reply);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        node_id = %self.node_id,
                        message_id = %message.id,
                        "listener failed: {e}"
                    );
                }
            }
        }
        answer
    }

    /// Stamps and sends a listener's reply back to the original sender.
    async fn send_answer(&self, mut answer: Message, original: &Message) -> Result<(), Error> {
        answer.id = Uuid::new_v4();
        answer.in_answer_to = Some(original.id);
        if answer.recipients.is_empty() {
            answer.recipients = vec![original.sender.clone()];
        }
        self.send(answer).await?;
        Ok(())
    }
}
