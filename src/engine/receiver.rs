use crate::{
    Error, RedisErrorKind, Result,
    engine::{
        Completion, CompletionData, Engine, Intern, NsMeta, Opcode, PostedEntry,
        RECV_FRAME_BUDGET, RequestCtx, Routing, TAG_INTERNAL, stage,
    },
    network::{Address, POLL_INTERVAL},
    resp::Value,
};
use bytes::Bytes;
use log::{debug, warn};
use smallvec::SmallVec;
use std::time::Duration;

impl Engine {
    /// One receiver tick: block for the first reply on any connection with
    /// posted traffic (up to `budget`), then drain whatever else is already
    /// buffered.
    pub(crate) async fn receive_pass(&mut self, budget: Duration) {
        let want = self.wanted();
        if !want.iter().any(|w| *w) {
            // nothing in flight (recovery pending or requests parked):
            // pace the drive loop instead of spinning
            if !self.retry.is_empty() || !self.work.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return;
        }

        let timeout = budget.min(POLL_INTERVAL);
        let Some((index, result)) = self.conn_mgr.read_any(&want, timeout).await else {
            return;
        };
        self.handle_read(index, result).await;
        self.drain_buffered().await;
    }

    /// Drains buffered replies without blocking.
    pub(crate) async fn drain_buffered(&mut self) {
        for _ in 0..RECV_FRAME_BUDGET {
            let want = self.wanted();
            if !want.iter().any(|w| *w) {
                return;
            }
            match self.conn_mgr.try_read_any(&want) {
                Some((index, result)) => self.handle_read(index, result).await,
                None => return,
            }
        }
    }

    async fn handle_read(&mut self, index: usize, result: Option<Result<Value>>) {
        match result {
            Some(Ok(value)) => self.process_value(index, value).await,
            // peer closed or receive error
            _ => self.connection_trouble(index),
        }
    }

    /// A connection broke: requeue its in-flight requests for another send
    /// pass, un-map its slots and hand it to the recovery machinery.
    pub(crate) fn connection_trouble(&mut self, index: usize) {
        let entries = std::mem::take(&mut self.posted[index]);
        for entry in entries {
            if let PostedEntry::Request(mut ctx) = entry {
                ctx.reset_for_resend();
                self.retry.push_back(ctx);
            }
        }
        self.locator.clear_conn(index);
        self.conn_mgr.fail(index);
    }

    async fn process_value(&mut self, index: usize, value: Value) {
        // redirect fast path; a multi-reply stage (MULTI/EXEC block) must
        // consume its full pipeline first, so its redirects are handled at
        // stage completion instead
        let front_is_single = match self.posted[index].front() {
            Some(PostedEntry::Request(ctx)) => {
                stage::spec(ctx.request.opcode, ctx.stage).resp_cnt == 1
            }
            _ => true,
        };
        if front_is_single && let Value::Error(error) = &value {
            match error.kind.clone() {
                RedisErrorKind::Moved { hash_slot, address } => {
                    let Some(PostedEntry::Request(ctx)) = self.posted[index].pop_front() else {
                        return;
                    };
                    if let Some(connection) = self.conn_mgr.get_mut(index) {
                        connection.slots.unset(hash_slot);
                    }
                    self.relocate(ctx, hash_slot, address).await;
                    return;
                }
                RedisErrorKind::Ask {
                    hash_slot: _,
                    address,
                } => {
                    let Some(PostedEntry::Request(ctx)) = self.posted[index].pop_front() else {
                        return;
                    };
                    self.ask_redirect(ctx, address).await;
                    return;
                }
                _ => {}
            }
        }

        let Some(entry) = self.posted[index].pop_front() else {
            warn!("connection {index}: unexpected reply {value:?}");
            return;
        };

        let mut ctx = match entry {
            PostedEntry::Ephemeral => return,
            PostedEntry::Request(ctx) => ctx,
        };

        ctx.replies.push(value);
        let spec = stage::spec(ctx.request.opcode, ctx.stage);
        if ctx.replies.len() < spec.resp_cnt {
            // more replies of the same stage outstanding
            self.posted[index].push_front(PostedEntry::Request(ctx));
            return;
        }

        let replies = std::mem::take(&mut ctx.replies);
        self.process_replies(ctx, replies).await;
    }

    /// `MOVED`: the slot permanently lives elsewhere. Update the locator
    /// and resend pinned to the new owner.
    async fn relocate(&mut self, mut ctx: RequestCtx, slot: u16, address: (String, u16)) {
        debug!("slot {slot} moved to {}:{}", address.0, address.1);

        match self.link_to(address.into()).await {
            Some(dest) => {
                if let Some(connection) = self.conn_mgr.get_mut(dest) {
                    connection.slots.set(slot);
                }
                self.locator.assign(slot, dest);
                ctx.reset_for_resend();
                ctx.routing = Routing::Conn {
                    index: dest,
                    asking: false,
                };
                self.retry.push_back(ctx);
            }
            None => self.deliver(Completion::error(ctx.tag, Error::NoConnect)),
        }
    }

    /// `ASK`: one-off redirect during slot migration; the locator is left
    /// untouched and the resend is prefixed with ASKING.
    async fn ask_redirect(&mut self, mut ctx: RequestCtx, address: (String, u16)) {
        match self.link_to(address.into()).await {
            Some(dest) => {
                ctx.reset_for_resend();
                ctx.routing = Routing::Conn {
                    index: dest,
                    asking: true,
                };
                self.retry.push_back(ctx);
            }
            None => self.deliver(Completion::error(ctx.tag, Error::NoConnect)),
        }
    }

    async fn link_to(&mut self, address: Address) -> Option<usize> {
        match self.conn_mgr.find_active(&address) {
            Some(index) => Some(index),
            None => self.conn_mgr.newlink(address).await.ok(),
        }
    }

    /// Per-opcode post-processing once a stage collected its replies.
    async fn process_replies(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        // a server error terminates the request, whatever the stage;
        // redirects of multi-reply stages resend the whole stage
        if let Some(error) = replies.iter().find_map(|value| match value {
            Value::Error(e) => Some(e.clone()),
            _ => None,
        }) {
            match error.kind {
                RedisErrorKind::Moved { hash_slot, address } => {
                    self.relocate(ctx, hash_slot, address).await;
                }
                RedisErrorKind::Ask {
                    hash_slot: _,
                    address,
                } => {
                    self.ask_redirect(ctx, address).await;
                }
                RedisErrorKind::NoAuth | RedisErrorKind::WrongPass => {
                    self.deliver(Completion::error(ctx.tag, Error::NoAuth));
                }
                _ => {
                    self.deliver(Completion::error(ctx.tag, Error::Redis(error)));
                }
            }
            return;
        }

        match ctx.request.opcode {
            Opcode::Put => self.process_put(ctx, replies),
            Opcode::Get | Opcode::Read => self.process_get(ctx, replies),
            Opcode::Remove => self.process_remove(ctx, replies),
            Opcode::Move => self.process_move(ctx, replies),
            Opcode::Directory => self.process_directory(ctx, replies),
            Opcode::NsCreate => self.process_nscreate(ctx, replies),
            Opcode::NsAttach => self.process_nsattach(ctx, replies),
            Opcode::NsDetach => self.process_nsdetach(ctx, replies),
            Opcode::NsDelete => self.process_nsdelete(ctx, replies),
            Opcode::NsQuery => self.process_nsquery(ctx, replies),
            Opcode::Iterator => self.process_iterator(ctx, replies),
            Opcode::NsAddUnits | Opcode::NsRemoveUnits => {
                self.deliver(Completion::error(ctx.tag, Error::NotImplemented))
            }
        }
    }

    /// Requeues the context for its next stage.
    fn advance(&mut self, mut ctx: RequestCtx, next_stage: usize, routing: Routing) {
        ctx.stage = next_stage;
        ctx.routing = routing;
        ctx.replies.clear();
        self.retry.push_back(ctx);
    }

    fn fail(&mut self, ctx: RequestCtx, error: Error) {
        self.deliver(Completion::error(ctx.tag, error));
    }

    fn process_put(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match replies[0].as_integer() {
            Ok(inserted) if inserted >= 1 => {
                self.deliver(Completion::ok(ctx.tag, inserted));
            }
            Ok(_) => self.fail(ctx, Error::Ubuffer),
            Err(e) => self.fail(ctx, e),
        }
    }

    fn process_get(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match &replies[0] {
            Value::Bulk(value) => {
                let completion = Completion::ok_with(
                    ctx.tag,
                    value.len() as i64,
                    CompletionData::Value(value.clone()),
                );
                self.deliver(completion);
            }
            Value::Null => self.fail(ctx, Error::Unavailable),
            _ => self.fail(ctx, Error::BeGeneral),
        }
    }

    fn process_remove(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match replies[0].as_integer() {
            Ok(deleted) if deleted >= 1 => self.deliver(Completion::ok(ctx.tag, deleted)),
            Ok(_) => self.fail(ctx, Error::Unavailable),
            Err(e) => self.fail(ctx, e),
        }
    }

    fn process_move(&mut self, mut ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match ctx.stage {
            stage::MOVE_STAGE_DUMP => match &replies[0] {
                Value::Bulk(dump) => {
                    ctx.intern = Intern::Move {
                        dump: Some(dump.clone()),
                    };
                    self.advance(ctx, stage::MOVE_STAGE_RESTORE, Routing::Unknown);
                }
                Value::Null => self.fail(ctx, Error::Unavailable),
                _ => self.fail(ctx, Error::BeGeneral),
            },
            stage::MOVE_STAGE_RESTORE => {
                if replies[0].is_ok() {
                    self.advance(ctx, stage::MOVE_STAGE_DEL, Routing::Unknown);
                } else {
                    self.fail(ctx, Error::BeGeneral);
                }
            }
            _ => match replies[0].as_integer() {
                Ok(deleted) => self.deliver(Completion::ok(ctx.tag, deleted)),
                Err(e) => self.fail(ctx, e),
            },
        }
    }

    fn process_directory(&mut self, mut ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match ctx.stage {
            stage::DIRECTORY_STAGE_META => match replies[0].as_array() {
                Ok(meta) if !meta.is_empty() => {
                    let conns = self.conn_mgr.active_indices();
                    let Some(&first) = conns.first() else {
                        return self.fail(ctx, Error::NoConnect);
                    };
                    ctx.intern = Intern::Directory {
                        names: Vec::new(),
                        cursor: "0".to_owned(),
                        conns,
                        conn_pos: 0,
                    };
                    self.advance(
                        ctx,
                        stage::DIRECTORY_STAGE_SCAN,
                        Routing::Conn {
                            index: first,
                            asking: false,
                        },
                    );
                }
                // the namespace hash does not exist
                Ok(_) => self.fail(ctx, Error::Unavailable),
                Err(e) => self.fail(ctx, e),
            },
            _ => {
                let (cursor, keys) = match parse_scan_reply(&replies[0]) {
                    Ok(parsed) => parsed,
                    Err(e) => return self.fail(ctx, e),
                };

                let Intern::Directory {
                    mut names,
                    conns,
                    mut conn_pos,
                    ..
                } = std::mem::take(&mut ctx.intern)
                else {
                    return self.fail(ctx, Error::BeGeneral);
                };

                let prefix_len = ctx.request.ns.len() + 2;
                for key in keys {
                    if key.len() >= prefix_len {
                        names.push(key.slice(prefix_len..));
                    }
                }

                if cursor == "0" {
                    conn_pos += 1;
                    if conn_pos >= conns.len() {
                        // every connection has been walked
                        let length: usize =
                            names.iter().map(|n| n.len()).sum::<usize>() + names.len().saturating_sub(1);
                        let completion = Completion::ok_with(
                            ctx.tag,
                            length as i64,
                            CompletionData::Names(names),
                        );
                        return self.deliver(completion);
                    }

                    let next_conn = conns[conn_pos];
                    ctx.intern = Intern::Directory {
                        names,
                        cursor: "0".to_owned(),
                        conns,
                        conn_pos,
                    };
                    self.advance(
                        ctx,
                        stage::DIRECTORY_STAGE_SCAN,
                        Routing::Conn {
                            index: next_conn,
                            asking: false,
                        },
                    );
                } else {
                    let routing = ctx.routing;
                    ctx.intern = Intern::Directory {
                        names,
                        cursor,
                        conns,
                        conn_pos,
                    };
                    self.advance(ctx, stage::DIRECTORY_STAGE_SCAN, routing);
                }
            }
        }
    }

    fn process_nscreate(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match ctx.stage {
            0 => match replies[0].as_integer() {
                // HSETNX returned 0: the id field was already there
                Ok(0) => self.fail(ctx, Error::Exists),
                Ok(_) => {
                    let routing = ctx.routing;
                    self.advance(ctx, 1, routing);
                }
                Err(e) => self.fail(ctx, e),
            },
            _ => {
                if replies[0].is_ok() {
                    self.deliver(Completion::ok(ctx.tag, 0));
                } else {
                    self.fail(ctx, Error::BeGeneral);
                }
            }
        }
    }

    fn process_nsattach(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match ctx.stage {
            0 => match replies[0].as_integer() {
                Ok(0) => self.fail(ctx, Error::NsInvalid),
                Ok(_) => {
                    let routing = ctx.routing;
                    self.advance(ctx, 1, routing);
                }
                Err(e) => self.fail(ctx, e),
            },
            _ => match replies[0].as_integer() {
                Ok(refcnt) if refcnt >= 1 => self.deliver(Completion::ok(ctx.tag, refcnt)),
                Ok(_) => self.fail(ctx, Error::NsInvalid),
                Err(e) => self.fail(ctx, e),
            },
        }
    }

    fn process_nsdetach(&mut self, mut ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match ctx.stage {
            stage::NSDETACH_STAGE_DELCHECK => {
                // MULTI pipeline: OK, QUEUED, QUEUED, then the EXEC array
                // [refcnt-after-decrement, [refcnt, flags]]
                let exec = match replies.last().map(|r| r.as_array()) {
                    Some(Ok(exec)) if exec.len() == 2 => exec,
                    _ => return self.fail(ctx, Error::BeGeneral),
                };
                let refcnt_after = match exec[0].as_number() {
                    Ok(refcnt_after) => refcnt_after,
                    Err(e) => return self.fail(ctx, e),
                };

                if refcnt_after < 0 {
                    // the namespace never existed; the decrement created junk
                    return self.fail(ctx, Error::Unavailable);
                }

                if refcnt_after > 0 {
                    // more attachments remain: the decrement is all there is
                    // to do
                    return self.deliver(Completion::ok(ctx.tag, refcnt_after));
                }

                // last detach: remove the namespace content, then the
                // namespace itself
                let conns = self.conn_mgr.active_indices();
                let Some(&first) = conns.first() else {
                    return self.fail(ctx, Error::NoConnect);
                };
                ctx.intern = Intern::Detach {
                    cursor: "0".to_owned(),
                    conns,
                    conn_pos: 0,
                    pending_keys: Default::default(),
                    current_key: None,
                };
                self.advance(
                    ctx,
                    stage::NSDETACH_STAGE_SCAN,
                    Routing::Conn {
                        index: first,
                        asking: false,
                    },
                );
            }
            stage::NSDETACH_STAGE_SCAN => {
                let (cursor, keys) = match parse_scan_reply(&replies[0]) {
                    Ok(parsed) => parsed,
                    Err(e) => return self.fail(ctx, e),
                };

                let Intern::Detach {
                    conns,
                    mut conn_pos,
                    mut pending_keys,
                    current_key,
                    ..
                } = std::mem::take(&mut ctx.intern)
                else {
                    return self.fail(ctx, Error::BeGeneral);
                };

                pending_keys.extend(keys);

                if cursor == "0" {
                    conn_pos += 1;
                    if conn_pos >= conns.len() {
                        let next_stage = if pending_keys.is_empty() {
                            stage::NSDETACH_STAGE_DELNS
                        } else {
                            stage::NSDETACH_STAGE_DELKEYS
                        };
                        ctx.intern = Intern::Detach {
                            cursor: "0".to_owned(),
                            conns,
                            conn_pos,
                            pending_keys,
                            current_key,
                        };
                        return self.advance(ctx, next_stage, Routing::Unknown);
                    }

                    let next_conn = conns[conn_pos];
                    ctx.intern = Intern::Detach {
                        cursor: "0".to_owned(),
                        conns,
                        conn_pos,
                        pending_keys,
                        current_key,
                    };
                    self.advance(
                        ctx,
                        stage::NSDETACH_STAGE_SCAN,
                        Routing::Conn {
                            index: next_conn,
                            asking: false,
                        },
                    );
                } else {
                    let routing = ctx.routing;
                    ctx.intern = Intern::Detach {
                        cursor,
                        conns,
                        conn_pos,
                        pending_keys,
                        current_key,
                    };
                    self.advance(ctx, stage::NSDETACH_STAGE_SCAN, routing);
                }
            }
            stage::NSDETACH_STAGE_DELKEYS => {
                if let Err(e) = replies[0].as_integer() {
                    return self.fail(ctx, e);
                }

                let Intern::Detach {
                    pending_keys,
                    current_key,
                    ..
                } = &mut ctx.intern
                else {
                    return self.fail(ctx, Error::BeGeneral);
                };

                *current_key = None;
                let next_stage = if pending_keys.is_empty() {
                    stage::NSDETACH_STAGE_DELNS
                } else {
                    stage::NSDETACH_STAGE_DELKEYS
                };
                self.advance(ctx, next_stage, Routing::Unknown);
            }
            _ => match replies[0].as_integer() {
                Ok(deleted) => {
                    self.deliver(Completion::ok(ctx.tag, deleted.max(1)));
                }
                Err(e) => self.fail(ctx, e),
            },
        }
    }

    fn process_nsdelete(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        match ctx.stage {
            stage::NSDELETE_STAGE_EXIST => {
                let fields = match replies[0].as_array() {
                    Ok(fields) if fields.len() == 2 => fields,
                    _ => return self.fail(ctx, Error::BeGeneral),
                };

                let refcnt = match &fields[0] {
                    Value::Null => return self.fail(ctx, Error::Unavailable),
                    value => match value.as_number() {
                        Ok(refcnt) => refcnt,
                        Err(e) => return self.fail(ctx, e),
                    },
                };
                let flags = fields[1].as_number().unwrap_or(0);

                if refcnt > 1 {
                    return self.fail(ctx, Error::NsBusy);
                }
                if flags != 0 {
                    // already marked for deletion
                    return self.fail(ctx, Error::Unavailable);
                }

                let routing = ctx.routing;
                self.advance(ctx, stage::NSDELETE_STAGE_SETFLAG, routing);
            }
            _ => match replies[0].as_integer() {
                // 0 = updated the existing hash
                Ok(0) => self.deliver(Completion::ok(ctx.tag, 0)),
                // 1 = a fresh field was created: the namespace vanished
                // between the stages
                Ok(_) => self.fail(ctx, Error::Unavailable),
                Err(e) => self.fail(ctx, e),
            },
        }
    }

    fn process_nsquery(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        let pairs = match replies[0].as_array() {
            Ok(pairs) => pairs,
            Err(e) => return self.fail(ctx, e),
        };
        if pairs.is_empty() {
            return self.fail(ctx, Error::Ubuffer);
        }

        let mut meta = NsMeta::default();
        for pair in pairs.chunks_exact(2) {
            let (Ok(field), value) = (pair[0].as_str(), &pair[1]) else {
                continue;
            };
            match field {
                "id" => meta.id = value.as_str().unwrap_or_default().to_owned(),
                "refcnt" => meta.refcnt = value.as_number().unwrap_or(0),
                "groups" => meta.groups = value.as_str().unwrap_or_default().to_owned(),
                "flags" => meta.flags = value.as_number().unwrap_or(0),
                _ => {}
            }
        }

        let rc = pairs.len() as i64 / 2;
        self.deliver(Completion::ok_with(ctx.tag, rc, CompletionData::Meta(meta)));
    }

    fn process_iterator(&mut self, ctx: RequestCtx, replies: SmallVec<[Value; 4]>) {
        let Intern::Iterator { handle } = ctx.intern else {
            return self.fail(ctx, Error::BeGeneral);
        };
        let (cursor, keys) = match parse_scan_reply(&replies[0]) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(ctx, e),
        };

        let prefix_len = ctx.request.ns.len() + 2;
        let Some(record) = self.iterators.get_mut(handle) else {
            return self.fail(ctx, Error::Handle);
        };

        record.scan_in_flight = false;
        record.cursor = cursor.clone();
        for key in keys {
            if key.len() >= prefix_len {
                record.cache_key(key.slice(prefix_len..));
            }
        }
        if cursor == "0" {
            record.advance_conn();
        }

        if ctx.tag == TAG_INTERNAL {
            // prefetch filled the cache; nothing to deliver
            return;
        }

        if let Some(key) = record.pop_key() {
            let completion = Completion::ok_with(
                ctx.tag,
                handle as i64,
                CompletionData::IterKey { handle, key },
            );
            return self.deliver(completion);
        }

        if record.is_complete() {
            self.iterators.release(handle);
            return self.fail(ctx, Error::Unavailable);
        }

        // the cache is still dry: scan the next cursor position
        let Some(next_conn) = record.current_conn() else {
            self.iterators.release(handle);
            return self.fail(ctx, Error::Unavailable);
        };
        record.scan_in_flight = true;
        self.advance(
            ctx,
            0,
            Routing::Conn {
                index: next_conn,
                asking: false,
            },
        );
    }
}

/// `SCAN` replies come as `[cursor, [key, ...]]`.
fn parse_scan_reply(reply: &Value) -> Result<(String, Vec<Bytes>)> {
    let parts = reply.as_array()?;
    if parts.len() != 2 {
        return Err(Error::BeGeneral);
    }

    let cursor = parts[0].as_str()?.to_owned();
    let keys = parts[1]
        .as_array()?
        .iter()
        .map(|key| key.as_bulk().cloned())
        .collect::<Result<Vec<_>>>()?;
    Ok((cursor, keys))
}
