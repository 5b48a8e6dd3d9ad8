//! Scripted in-memory transport used by the test suite.
//!
//! Responses are registered per SQL text. Prepared statements resolve to
//! the text they were prepared with, so one script serves both the direct
//! and the prepared path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;

use crate::messages::{Message, MessageBroker};
use crate::transport::{
    CancelKind, ColumnBuffer, CommandHandle, ContextHandle, DataFormat, DynamicOp, ParamData,
    ResInfo, ResultType, RetCode, SessionHandle, SessionProperty, StatusFlags, Transport,
};
use crate::types::codec;
use crate::types::{TypeTag, Value};

pub(crate) const PING: &str = "SELECT 'PING'";
pub(crate) const ECHO: &str = "SELECT ? AS echo";

type Cell = Option<Vec<u8>>;
type Responder = Arc<dyn Fn(&[ParamData]) -> Vec<Phase> + Send + Sync>;

/// One result phase of a scripted response.
#[derive(Debug, Clone)]
pub(crate) enum Phase {
    Rows {
        columns: Vec<DataFormat>,
        rows: Vec<Vec<Cell>>,
    },
    Done(i32),
    CmdFail,
    /// `results` itself fails.
    Fail,
    Describe(Vec<DataFormat>),
}

impl Phase {
    /// A result set of typed values, encoded through the codec.
    pub(crate) fn rows(columns: &[(&str, TypeTag)], rows: Vec<Vec<Value>>) -> Phase {
        let formats = columns
            .iter()
            .map(|(name, tag)| column(name, *tag))
            .collect();
        Phase::rows_with(formats, rows)
    }

    /// A result set with explicit column formats.
    pub(crate) fn rows_with(mut columns: Vec<DataFormat>, rows: Vec<Vec<Value>>) -> Phase {
        let encoded: Vec<Vec<Cell>> = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(columns.iter())
                    .map(|(value, format)| {
                        let tag = TypeTag::from_code(format.datatype).unwrap();
                        let value = codec::convert(tag, value).unwrap();
                        (!value.is_null())
                            .then(|| codec::encode_payload(tag, &value).unwrap().to_vec())
                    })
                    .collect()
            })
            .collect();

        for (i, format) in columns.iter_mut().enumerate() {
            let tag = TypeTag::from_code(format.datatype).unwrap();
            if codec::entry(tag).unwrap().byte_size.is_some() {
                continue;
            }
            let widest = encoded
                .iter()
                .filter_map(|row| row[i].as_ref().map(Vec::len))
                .max()
                .unwrap_or(1);
            format.maxlength = format.maxlength.max(widest as i32);
        }
        Phase::Rows {
            columns,
            rows: encoded,
        }
    }

    /// A single-row result set returning each parameter as it was sent.
    pub(crate) fn echo(params: &[ParamData]) -> Phase {
        let columns = params
            .iter()
            .enumerate()
            .map(|(i, param)| DataFormat {
                name: if i == 0 { "echo".to_string() } else { format!("echo{}", i) },
                datatype: param.format.datatype,
                maxlength: param.data.as_ref().map_or(1, |d| d.len().max(1)) as i32,
                precision: param.format.precision,
                scale: param.format.scale,
                status: StatusFlags::CAN_BE_NULL,
                ..Default::default()
            })
            .collect();
        let row = params
            .iter()
            .map(|param| param.data.as_ref().map(|d| d.to_vec()))
            .collect();
        Phase::Rows {
            columns,
            rows: vec![row],
        }
    }
}

/// Nullable column description of type `tag`.
pub(crate) fn column(name: &str, tag: TypeTag) -> DataFormat {
    let size = codec::entry(tag).ok().and_then(|entry| entry.byte_size);
    DataFormat {
        name: name.to_string(),
        datatype: tag.code(),
        maxlength: size.unwrap_or(1) as i32,
        status: StatusFlags::CAN_BE_NULL,
        ..Default::default()
    }
}

enum Request {
    Language(String),
    Dynamic(DynamicOp, String, Option<String>),
}

#[derive(Default)]
struct MockCommand {
    pending: Option<Request>,
    params: Vec<ParamData>,
    phases: VecDeque<Phase>,
    current: Option<Phase>,
    row: usize,
    row_count: i32,
}

impl MockCommand {
    /// A new request is refused until the previous response is consumed
    /// or cancelled.
    fn results_pending(&self) -> bool {
        self.current.is_some() || !self.phases.is_empty()
    }
}

#[derive(Default)]
struct MockState {
    fail_ops: HashSet<&'static str>,
    responses: HashMap<String, Responder>,
    param_types: HashMap<String, Vec<TypeTag>>,
    rows_on_prepare: HashSet<String>,
    messages: HashMap<String, Vec<Message>>,
    broker: Option<Arc<MessageBroker>>,
    /// Item count reported for every phase in place of the real one.
    num_data: Option<i32>,
    contexts: HashSet<u64>,
    /// Session handle to its read-only property.
    sessions: HashMap<u64, bool>,
    commands: HashMap<u64, MockCommand>,
    statements: HashMap<String, String>,
    properties: Vec<SessionProperty>,
    executed: Vec<String>,
    params_sent: Vec<ParamData>,
    bound: Vec<DataFormat>,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    calls: AtomicUsize,
    next_handle: AtomicU64,
    state: Mutex<MockState>,
    gates: Mutex<HashMap<String, mpsc::Receiver<()>>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<MockTransport> {
        let mock = MockTransport::default();
        mock.respond(
            PING,
            vec![
                Phase::rows(&[("", TypeTag::Char)], vec![vec![Value::from("PING")]]),
                Phase::Done(1),
            ],
        );
        mock.respond_with(ECHO, |params| vec![Phase::echo(params), Phase::Done(1)]);
        Arc::new(mock)
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    pub(crate) fn respond(&self, sql: &str, phases: Vec<Phase>) {
        self.respond_with(sql, move |_| phases.clone());
    }

    pub(crate) fn respond_with<F>(&self, sql: &str, responder: F)
    where
        F: Fn(&[ParamData]) -> Vec<Phase> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .responses
            .insert(sql.to_string(), Arc::new(responder));
    }

    pub(crate) fn describe_params(&self, sql: &str, types: Vec<TypeTag>) {
        self.state
            .lock()
            .param_types
            .insert(sql.to_string(), types);
    }

    pub(crate) fn rows_on_prepare(&self, sql: &str) {
        self.state.lock().rows_on_prepare.insert(sql.to_string());
    }

    /// Report `count` as the item count of every result phase.
    pub(crate) fn misreport_num_data(&self, count: i32) {
        self.state.lock().num_data = Some(count);
    }

    /// Dispatch `message` to the registered broker whenever `sql` is sent.
    pub(crate) fn raise(&self, sql: &str, message: Message) {
        self.state
            .lock()
            .messages
            .entry(sql.to_string())
            .or_default()
            .push(message);
    }

    /// Make the named primitive fail from now on.
    pub(crate) fn fail(&self, op: &'static str) {
        self.state.lock().fail_ops.insert(op);
    }

    pub(crate) fn heal(&self, op: &'static str) {
        self.state.lock().fail_ops.remove(op);
    }

    /// Block the next send of `sql` until the returned sender fires.
    pub(crate) fn gate(&self, sql: &str) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.gates.lock().insert(sql.to_string(), rx);
        tx
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Language texts and executed prepared statements, in order.
    pub(crate) fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub(crate) fn properties(&self) -> Vec<SessionProperty> {
        self.state.lock().properties.clone()
    }

    pub(crate) fn params_sent(&self) -> Vec<ParamData> {
        self.state.lock().params_sent.clone()
    }

    pub(crate) fn bound(&self) -> Vec<DataFormat> {
        self.state.lock().bound.clone()
    }

    pub(crate) fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub(crate) fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub(crate) fn live_commands(&self) -> usize {
        self.state.lock().commands.len()
    }

    pub(crate) fn live_statements(&self) -> usize {
        self.state.lock().statements.len()
    }

    pub(crate) fn session_read_only(&self, session: SessionHandle) -> Option<bool> {
        self.state.lock().sessions.get(&session.0).copied()
    }

    pub(crate) fn set_session_read_only(&self, session: SessionHandle, read_only: bool) {
        self.state.lock().sessions.insert(session.0, read_only);
    }

    // ------------------------------------------------------------------

    fn enter(&self, op: &'static str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().fail_ops.contains(op)
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn respond_to(state: &MockState, sql: &str, params: &[ParamData]) -> Vec<Phase> {
        match state.responses.get(sql) {
            Some(responder) => responder(params),
            None => vec![Phase::Done(-1)],
        }
    }

    /// Resolve a request into its response phases and the SQL it ran.
    fn process(state: &mut MockState, request: Request, params: Vec<ParamData>) -> (String, Vec<Phase>) {
        match request {
            Request::Language(text) => {
                state.executed.push(text.clone());
                let phases = Self::respond_to(state, &text, &[]);
                (text, phases)
            }
            Request::Dynamic(DynamicOp::Prepare, name, text) => {
                let text = text.unwrap_or_default();
                state.statements.insert(name.clone(), text.clone());
                let phases = if state.rows_on_prepare.contains(&text) {
                    vec![
                        Phase::rows(&[("x", TypeTag::Int)], vec![vec![Value::Int(1)]]),
                        Phase::Done(1),
                    ]
                } else {
                    vec![Phase::Done(-1)]
                };
                (format!("PREPARE {}", name), phases)
            }
            Request::Dynamic(DynamicOp::DescribeInput, name, _) => {
                let sql = state.statements.get(&name).cloned().unwrap_or_default();
                let types = state
                    .param_types
                    .get(&sql)
                    .cloned()
                    .unwrap_or_else(|| vec![TypeTag::Int; sql.matches('?').count()]);
                let formats = types
                    .iter()
                    .enumerate()
                    .map(|(i, tag)| column(&format!("@p{}", i + 1), *tag))
                    .collect();
                (
                    format!("DESCRIBE {}", name),
                    vec![Phase::Describe(formats), Phase::Done(-1)],
                )
            }
            Request::Dynamic(DynamicOp::Execute, name, _) => {
                let sql = state.statements.get(&name).cloned().unwrap_or_default();
                state.executed.push(sql.clone());
                state.params_sent.extend(params.iter().cloned());
                let phases = Self::respond_to(state, &sql, &params);
                (sql, phases)
            }
            Request::Dynamic(DynamicOp::Dealloc, name, _) => {
                state.statements.remove(&name);
                (format!("DEALLOC {}", name), vec![Phase::Done(-1)])
            }
        }
    }
}

impl Transport for MockTransport {
    fn context_alloc(&self) -> Result<ContextHandle, RetCode> {
        if self.enter("context_alloc") {
            return Err(RetCode::Fail);
        }
        let handle = self.handle();
        self.state.lock().contexts.insert(handle);
        Ok(ContextHandle(handle))
    }

    fn context_init(&self, _ctx: ContextHandle) -> RetCode {
        if self.enter("context_init") {
            return RetCode::Fail;
        }
        RetCode::Succeed
    }

    fn set_message_callbacks(&self, _ctx: ContextHandle, broker: Arc<MessageBroker>) -> RetCode {
        if self.enter("set_message_callbacks") {
            return RetCode::Fail;
        }
        self.state.lock().broker = Some(broker);
        RetCode::Succeed
    }

    fn context_exit(&self, _ctx: ContextHandle) -> RetCode {
        if self.enter("context_exit") {
            return RetCode::Fail;
        }
        RetCode::Succeed
    }

    fn context_drop(&self, ctx: ContextHandle) -> RetCode {
        if self.enter("context_drop") {
            return RetCode::Fail;
        }
        self.state.lock().contexts.remove(&ctx.0);
        RetCode::Succeed
    }

    fn session_alloc(&self, ctx: ContextHandle) -> Result<SessionHandle, RetCode> {
        if self.enter("session_alloc") {
            return Err(RetCode::Fail);
        }
        let mut state = self.state.lock();
        if !state.contexts.contains(&ctx.0) {
            return Err(RetCode::Fail);
        }
        let handle = self.handle();
        state.sessions.insert(handle, false);
        Ok(SessionHandle(handle))
    }

    fn set_property(&self, session: SessionHandle, property: &SessionProperty) -> RetCode {
        if self.enter("set_property") {
            return RetCode::Fail;
        }
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.0) {
            return RetCode::Fail;
        }
        if let SessionProperty::ReadOnly(read_only) = property {
            state.sessions.insert(session.0, *read_only);
        }
        state.properties.push(property.clone());
        RetCode::Succeed
    }

    fn read_only(&self, session: SessionHandle) -> Result<bool, RetCode> {
        if self.enter("read_only") {
            return Err(RetCode::Fail);
        }
        self.state
            .lock()
            .sessions
            .get(&session.0)
            .copied()
            .ok_or(RetCode::Fail)
    }

    fn connect(&self, _session: SessionHandle) -> RetCode {
        if self.enter("connect") {
            return RetCode::Fail;
        }
        RetCode::Succeed
    }

    fn session_cancel(&self, _session: SessionHandle) -> RetCode {
        if self.enter("session_cancel") {
            return RetCode::Fail;
        }
        RetCode::Succeed
    }

    fn session_close(&self, _session: SessionHandle) -> RetCode {
        if self.enter("session_close") {
            return RetCode::Fail;
        }
        RetCode::Succeed
    }

    fn session_drop(&self, session: SessionHandle) -> RetCode {
        if self.enter("session_drop") {
            return RetCode::Fail;
        }
        self.state.lock().sessions.remove(&session.0);
        RetCode::Succeed
    }

    fn command_alloc(&self, session: SessionHandle) -> Result<CommandHandle, RetCode> {
        if self.enter("command_alloc") {
            return Err(RetCode::Fail);
        }
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.0) {
            return Err(RetCode::Fail);
        }
        let handle = self.handle();
        state.commands.insert(handle, MockCommand::default());
        Ok(CommandHandle(handle))
    }

    fn language(&self, cmd: CommandHandle, text: &str) -> RetCode {
        if self.enter("language") {
            return RetCode::Fail;
        }
        match self.state.lock().commands.get_mut(&cmd.0) {
            Some(command) => {
                command.pending = Some(Request::Language(text.to_string()));
                RetCode::Succeed
            }
            None => RetCode::Fail,
        }
    }

    fn dynamic(&self, cmd: CommandHandle, op: DynamicOp, name: &str, text: Option<&str>) -> RetCode {
        if self.enter("dynamic") {
            return RetCode::Fail;
        }
        match self.state.lock().commands.get_mut(&cmd.0) {
            Some(command) if command.results_pending() => RetCode::Fail,
            Some(command) => {
                command.pending = Some(Request::Dynamic(
                    op,
                    name.to_string(),
                    text.map(str::to_string),
                ));
                command.params.clear();
                RetCode::Succeed
            }
            None => RetCode::Fail,
        }
    }

    fn param(&self, cmd: CommandHandle, param: &ParamData) -> RetCode {
        if self.enter("param") {
            return RetCode::Fail;
        }
        match self.state.lock().commands.get_mut(&cmd.0) {
            Some(command) => {
                command.params.push(param.clone());
                RetCode::Succeed
            }
            None => RetCode::Fail,
        }
    }

    fn send(&self, cmd: CommandHandle) -> RetCode {
        if self.enter("send") {
            return RetCode::Fail;
        }

        let (sql, phases, messages, broker) = {
            let mut state = self.state.lock();
            let Some(command) = state.commands.get_mut(&cmd.0) else {
                return RetCode::Fail;
            };
            let Some(request) = command.pending.take() else {
                return RetCode::Fail;
            };
            let params = std::mem::take(&mut command.params);
            let (sql, phases) = Self::process(&mut state, request, params);
            let messages = state.messages.get(&sql).cloned().unwrap_or_default();
            (sql, phases, messages, state.broker.clone())
        };

        let gate = self.gates.lock().remove(&sql);
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        if let Some(broker) = broker {
            for message in &messages {
                broker.dispatch(message);
            }
        }

        match self.state.lock().commands.get_mut(&cmd.0) {
            Some(command) => {
                command.phases = phases.into();
                command.current = None;
                RetCode::Succeed
            }
            None => RetCode::Fail,
        }
    }

    fn results(&self, cmd: CommandHandle) -> (RetCode, ResultType) {
        if self.enter("results") {
            return (RetCode::Fail, ResultType::Other(0));
        }
        let mut state = self.state.lock();
        let Some(command) = state.commands.get_mut(&cmd.0) else {
            return (RetCode::Fail, ResultType::Other(0));
        };
        command.current = None;
        match command.phases.pop_front() {
            None => (RetCode::EndResults, ResultType::Other(0)),
            Some(phase @ Phase::Rows { .. }) => {
                command.current = Some(phase);
                command.row = 0;
                (RetCode::Succeed, ResultType::Row)
            }
            Some(phase @ Phase::Describe(_)) => {
                command.current = Some(phase);
                (RetCode::Succeed, ResultType::Describe)
            }
            Some(Phase::Done(count)) => {
                command.row_count = count;
                (RetCode::Succeed, ResultType::CmdDone)
            }
            Some(Phase::CmdFail) => (RetCode::Succeed, ResultType::CmdFail),
            Some(Phase::Fail) => (RetCode::Fail, ResultType::Other(0)),
        }
    }

    fn res_info(&self, cmd: CommandHandle, info: ResInfo) -> Result<i32, RetCode> {
        if self.enter("res_info") {
            return Err(RetCode::Fail);
        }
        let state = self.state.lock();
        let command = state.commands.get(&cmd.0).ok_or(RetCode::Fail)?;
        if let (ResInfo::NumData, Some(count), Some(_)) = (info, state.num_data, &command.current) {
            return Ok(count);
        }
        match (info, &command.current) {
            (ResInfo::RowCount, _) => Ok(command.row_count),
            (ResInfo::NumData, Some(Phase::Rows { columns, .. })) => Ok(columns.len() as i32),
            (ResInfo::NumData, Some(Phase::Describe(params))) => Ok(params.len() as i32),
            (ResInfo::NumData, _) => Err(RetCode::Fail),
        }
    }

    fn describe(&self, cmd: CommandHandle, item: usize) -> Result<DataFormat, RetCode> {
        if self.enter("describe") {
            return Err(RetCode::Fail);
        }
        let state = self.state.lock();
        let command = state.commands.get(&cmd.0).ok_or(RetCode::Fail)?;
        match &command.current {
            Some(Phase::Rows { columns, .. }) => columns.get(item).cloned().ok_or(RetCode::Fail),
            Some(Phase::Describe(params)) => params.get(item).cloned().ok_or(RetCode::Fail),
            _ => Err(RetCode::Fail),
        }
    }

    fn bind(&self, cmd: CommandHandle, _item: usize, format: &DataFormat) -> RetCode {
        if self.enter("bind") {
            return RetCode::Fail;
        }
        let mut state = self.state.lock();
        if !state.commands.contains_key(&cmd.0) {
            return RetCode::Fail;
        }
        state.bound.push(format.clone());
        RetCode::Succeed
    }

    fn fetch(&self, cmd: CommandHandle, buffers: &mut [ColumnBuffer]) -> RetCode {
        if self.enter("fetch") {
            return RetCode::Fail;
        }
        let mut state = self.state.lock();
        let Some(command) = state.commands.get_mut(&cmd.0) else {
            return RetCode::Fail;
        };
        let Some(Phase::Rows { rows, .. }) = &command.current else {
            return RetCode::Fail;
        };
        let Some(row) = rows.get(command.row) else {
            return RetCode::EndData;
        };
        if row.len() != buffers.len() {
            return RetCode::Fail;
        }
        for (cell, buffer) in row.iter().zip(buffers.iter_mut()) {
            buffer.data.fill(0);
            match cell {
                Some(bytes) => {
                    let n = bytes.len().min(buffer.data.len());
                    buffer.data[..n].copy_from_slice(&bytes[..n]);
                    buffer.copied = n;
                    buffer.indicator = 0;
                }
                None => {
                    buffer.copied = 0;
                    buffer.indicator = -1;
                }
            }
        }
        command.row += 1;
        RetCode::Succeed
    }

    fn cancel(&self, cmd: CommandHandle, _kind: CancelKind) -> RetCode {
        if self.enter("cancel") {
            return RetCode::Fail;
        }
        match self.state.lock().commands.get_mut(&cmd.0) {
            Some(command) => {
                command.phases.clear();
                command.current = None;
                RetCode::Succeed
            }
            None => RetCode::Fail,
        }
    }

    fn command_drop(&self, cmd: CommandHandle) -> RetCode {
        if self.enter("command_drop") {
            return RetCode::Fail;
        }
        match self.state.lock().commands.remove(&cmd.0) {
            Some(_) => RetCode::Succeed,
            None => RetCode::Fail,
        }
    }
}
