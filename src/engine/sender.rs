use crate::{
    Error,
    engine::{
        COALESCED_MAX, Completion, CompletionData, Engine, Intern, Opcode, PostedEntry, Request,
        RequestCtx, Routing, TAG_INTERNAL, stage,
    },
    network::{Recovery, hash_slot},
    resp::{Command, cmd},
};
use log::{debug, warn};

impl Engine {
    /// One sender pass: gate on slot coverage (running recovery when it is
    /// lost), then drain the retry queue ahead of the work queue, route each
    /// request and coalesce the commands per connection, flushing in first-
    /// use order.
    pub(crate) async fn send_pass(&mut self) {
        if !self.locator.covered() {
            let verdict = self
                .conn_mgr
                .recover(&mut self.locator, &mut self.cluster, &self.config.server)
                .await;
            match verdict {
                Recovery::Recovered => {}
                Recovery::Recoverable => return,
                Recovery::Unrecoverable => {
                    warn!("cluster unrecoverable; failing all queued requests");
                    self.drain_unsendable();
                    return;
                }
            }
        }

        let mut flush_order: Vec<usize> = Vec::new();
        let mut parked: Vec<RequestCtx> = Vec::new();
        let budget = COALESCED_MAX * self.conn_mgr.connection_count().max(1);

        for _ in 0..budget {
            let Some(ctx) = self.retry.pop_front().or_else(|| self.work.pop_front()) else {
                break;
            };

            // dropped before hitting the wire
            if ctx.tag != TAG_INTERNAL && self.cancellations.remove(&ctx.tag) {
                self.deliver(Completion::error(ctx.tag, Error::Cancelled));
                continue;
            }

            let mut ctx = if ctx.request.opcode == Opcode::Iterator {
                match self.iterator_preprocess(ctx) {
                    Some(ctx) => ctx,
                    // served from the cache or already failed
                    None => continue,
                }
            } else {
                ctx
            };

            let Some(conn_index) = self.resolve_routing(&mut ctx) else {
                // uncovered slot or vanished pinned connection: try again
                // after the next recovery tick
                parked.push(ctx);
                continue;
            };

            let command = match self.build_stage_command(&mut ctx) {
                Ok(command) => command,
                Err(e) => {
                    self.deliver(Completion::error(ctx.tag, e));
                    continue;
                }
            };

            let asking = matches!(ctx.routing, Routing::Conn { asking: true, .. });
            let Some(connection) = self.conn_mgr.get_mut(conn_index) else {
                parked.push(ctx);
                continue;
            };

            let mut sent = Ok(());
            if asking {
                sent = connection.feed(&cmd("ASKING").into()).await;
                if sent.is_ok() {
                    self.posted[conn_index].push_back(PostedEntry::Ephemeral);
                }
            }
            if sent.is_ok() {
                sent = connection.feed(&command).await;
            }

            match sent {
                Ok(()) => {
                    self.posted[conn_index].push_back(PostedEntry::Request(ctx));
                    if !flush_order.contains(&conn_index) {
                        flush_order.push(conn_index);
                    }
                }
                Err(e) => {
                    debug!("send on connection {conn_index} failed: {e}");
                    ctx.reset_for_resend();
                    parked.push(ctx);
                    self.connection_trouble(conn_index);
                }
            }
        }

        self.retry.extend(parked);

        for index in flush_order {
            let flushed = match self.conn_mgr.get_mut(index) {
                Some(connection) => connection.flush().await.is_ok(),
                None => true,
            };
            if !flushed {
                self.connection_trouble(index);
            }
        }
    }

    /// Pinned routing is reused as-is; everything else hashes the stage key
    /// and consults the locator.
    fn resolve_routing(&mut self, ctx: &mut RequestCtx) -> Option<usize> {
        if let Routing::Conn { index, .. } = ctx.routing {
            if self.conn_mgr.get_mut(index).is_some() {
                return Some(index);
            }
            ctx.routing = Routing::Unknown;
        }

        let key = self.routing_key(ctx)?;
        let slot = hash_slot(&key);
        let index = self.locator.conn_index(slot)?;
        ctx.routing = Routing::Conn {
            index,
            asking: false,
        };
        Some(index)
    }

    /// The Redis key whose hash slot routes the current stage.
    fn routing_key(&self, ctx: &RequestCtx) -> Option<Vec<u8>> {
        let request = &ctx.request;
        match request.opcode {
            Opcode::Put | Opcode::Get | Opcode::Read | Opcode::Remove => {
                Some(request.qualified_key())
            }
            Opcode::Move => match ctx.stage {
                stage::MOVE_STAGE_RESTORE => Some(request.qualified_dst_key()),
                _ => Some(request.qualified_key()),
            },
            Opcode::Directory => match ctx.stage {
                stage::DIRECTORY_STAGE_META => Some(request.ns.clone().into_bytes()),
                // SCAN stages are pinned to a connection
                _ => None,
            },
            Opcode::NsCreate | Opcode::NsAttach | Opcode::NsQuery | Opcode::NsDelete => {
                Some(request.ns.clone().into_bytes())
            }
            Opcode::NsDetach => match ctx.stage {
                stage::NSDETACH_STAGE_DELKEYS => match &ctx.intern {
                    Intern::Detach {
                        current_key: Some(key),
                        ..
                    } => Some(key.to_vec()),
                    Intern::Detach { pending_keys, .. } => {
                        pending_keys.front().map(|key| key.to_vec())
                    }
                    _ => None,
                },
                stage::NSDETACH_STAGE_SCAN => None,
                _ => Some(request.ns.clone().into_bytes()),
            },
            Opcode::Iterator => None,
            Opcode::NsAddUnits | Opcode::NsRemoveUnits => None,
        }
    }

    /// Expands the stage template with the positional arguments of the
    /// current stage.
    fn build_stage_command(&mut self, ctx: &mut RequestCtx) -> crate::Result<Command> {
        let spec = stage::spec(ctx.request.opcode, ctx.stage);
        let request = &ctx.request;

        match (request.opcode, ctx.stage) {
            (Opcode::Put, _) => {
                let key = request.qualified_key();
                stage::build_command(spec, &[&key, &request.value])
            }
            (Opcode::Get | Opcode::Read | Opcode::Remove, _) => {
                let key = request.qualified_key();
                stage::build_command(spec, &[&key])
            }
            (Opcode::Move, stage::MOVE_STAGE_DUMP | stage::MOVE_STAGE_DEL) => {
                let key = request.qualified_key();
                stage::build_command(spec, &[&key])
            }
            (Opcode::Move, stage::MOVE_STAGE_RESTORE) => {
                let Intern::Move { dump: Some(dump) } = &ctx.intern else {
                    return Err(Error::BeGeneral);
                };
                let key = request.qualified_dst_key();
                let dump = dump.clone();
                stage::build_command(spec, &[&key, &dump])
            }
            (Opcode::Directory, stage::DIRECTORY_STAGE_META) => {
                stage::build_command(spec, &[request.ns.as_bytes()])
            }
            (Opcode::Directory, _) => {
                let Intern::Directory { cursor, .. } = &ctx.intern else {
                    return Err(Error::BeGeneral);
                };
                let template = request.match_template();
                let cursor = cursor.clone();
                stage::build_command(spec, &[cursor.as_bytes(), &template])
            }
            (Opcode::NsCreate, 0) => stage::build_command(
                spec,
                &[request.ns.as_bytes(), b"id", request.ns.as_bytes()],
            ),
            (Opcode::NsCreate, _) => stage::build_command(
                spec,
                &[
                    request.ns.as_bytes(),
                    b"refcnt",
                    b"1",
                    b"groups",
                    request.groups.as_bytes(),
                    b"flags",
                    b"0",
                ],
            ),
            (Opcode::NsAttach, 0) => stage::build_command(spec, &[request.ns.as_bytes()]),
            (Opcode::NsAttach, _) => {
                stage::build_command(spec, &[request.ns.as_bytes(), b"1"])
            }
            (Opcode::NsQuery, _) => stage::build_command(spec, &[request.ns.as_bytes()]),
            (Opcode::NsDetach, stage::NSDETACH_STAGE_DELCHECK) => {
                stage::build_command(spec, &[request.ns.as_bytes(), b"-1"])
            }
            (Opcode::NsDetach, stage::NSDETACH_STAGE_SCAN) => {
                let Intern::Detach { cursor, .. } = &ctx.intern else {
                    return Err(Error::BeGeneral);
                };
                let cursor = cursor.clone();
                let template = request.match_template();
                stage::build_command(spec, &[cursor.as_bytes(), &template])
            }
            (Opcode::NsDetach, stage::NSDETACH_STAGE_DELKEYS) => {
                let Intern::Detach {
                    pending_keys,
                    current_key,
                    ..
                } = &mut ctx.intern
                else {
                    return Err(Error::BeGeneral);
                };
                // keep the key around until its reply arrives, in case the
                // connection dies and the stage must be resent
                if current_key.is_none() {
                    *current_key = pending_keys.pop_front();
                }
                let key = current_key.clone().ok_or(Error::BeGeneral)?;
                stage::build_command(spec, &[&key])
            }
            (Opcode::NsDetach, _) => stage::build_command(spec, &[request.ns.as_bytes()]),
            (Opcode::NsDelete, stage::NSDELETE_STAGE_EXIST) => {
                stage::build_command(spec, &[request.ns.as_bytes()])
            }
            (Opcode::NsDelete, _) => {
                stage::build_command(spec, &[request.ns.as_bytes(), b"flags", b"1"])
            }
            (Opcode::Iterator, _) => {
                let Intern::Iterator { handle } = ctx.intern else {
                    return Err(Error::BeGeneral);
                };
                let record = self.iterators.get_mut(handle).ok_or(Error::Invalid)?;
                let cursor = record.cursor.clone();
                let template = request.match_template();
                stage::build_command(spec, &[cursor.as_bytes(), &template])
            }
            (Opcode::NsAddUnits | Opcode::NsRemoveUnits, _) => Err(Error::NotImplemented),
            (Opcode::Move, _) => unreachable!("invalid move stage"),
        }
    }

    /// Iterator requests may be served from the key cache without touching
    /// the network. Returns the context back when a SCAN has to be sent.
    fn iterator_preprocess(&mut self, mut ctx: RequestCtx) -> Option<RequestCtx> {
        let handle = match ctx.request.iterator {
            Some(handle) => handle,
            None => {
                let conns = self.conn_mgr.active_indices();
                match self.iterators.allocate(&ctx.request.ns, conns) {
                    Some(handle) => handle,
                    None => {
                        self.deliver(Completion::error(ctx.tag, Error::TagError));
                        return None;
                    }
                }
            }
        };
        ctx.request.iterator = Some(handle);
        ctx.intern = Intern::Iterator { handle };

        let Some(record) = self.iterators.get_mut(handle) else {
            self.deliver(Completion::error(ctx.tag, Error::Handle));
            return None;
        };

        if let Some(key) = record.pop_key() {
            // prefetch keeps the cache warm while keys are handed out
            let prefetch = record.needs_refill() && !record.scan_in_flight;
            let conn = record.current_conn();
            if prefetch {
                record.scan_in_flight = true;
            }

            self.deliver(Completion::ok_with(
                ctx.tag,
                handle as i64,
                CompletionData::IterKey { handle, key },
            ));

            if prefetch && let Some(conn) = conn {
                let mut request = Request::new(Opcode::Iterator, ctx.request.ns.clone());
                request.pattern = ctx.request.pattern.clone();
                request.iterator = Some(handle);
                let mut prefetch_ctx = RequestCtx::new(TAG_INTERNAL, request);
                prefetch_ctx.intern = Intern::Iterator { handle };
                prefetch_ctx.routing = Routing::Conn {
                    index: conn,
                    asking: false,
                };
                self.retry.push_back(prefetch_ctx);
            }
            return None;
        }

        if record.is_complete() {
            // exhausted: the record auto-resets
            self.iterators.release(handle);
            self.deliver(Completion::error(ctx.tag, Error::Unavailable));
            return None;
        }

        if record.scan_in_flight {
            // a refill is already on the wire; its reply will fill the cache
            self.retry.push_back(ctx);
            return None;
        }

        let Some(conn) = record.current_conn() else {
            self.iterators.release(handle);
            self.deliver(Completion::error(ctx.tag, Error::Unavailable));
            return None;
        };
        record.scan_in_flight = true;
        ctx.routing = Routing::Conn {
            index: conn,
            asking: false,
        };
        Some(ctx)
    }
}
