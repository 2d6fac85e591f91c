// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The peer state machine: one endpoint of one bidirectional Cap'n Proto RPC
//! connection.
//!
//! `Peer` is a thin `Rc`-clonable handle over the real state (`Inner`),
//! following the same `Rc<RefCell<_>>` shared-mutable-state pattern the
//! teacher crate uses throughout `capnp-rpc`. The `Handler` is kept *outside*
//! the `RefCell` (a sibling field, not something `Inner` owns) so that
//! dispatching into embedder code never happens while `Inner` is borrowed —
//! every handler method here drops its borrow before calling into
//! `self.handler`, which is what makes synchronous re-entrant calls back
//! into `Peer` from inside a `Handler` callback safe.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use peer_wire::rpc::{
    self, Accept, Bootstrap, Call, CapDescriptor, Disembargo, DisembargoContext, Exception, ExceptionType, Finish,
    Join, JoinKeyPart, Message, MessageTarget, Payload, Provide, Release, Resolve, ResolveWhich, Return, ReturnWhich,
    SendResultsTo, ThirdPartyAnswer,
};
use peer_wire::value::AnyValue;

use crate::captable::{CapTable, ExportId, ImportId};
use crate::config::PeerConfig;
use crate::error::{PeerError, PeerErrorKind, Result};
use crate::inbound;
use crate::outbound::{self, OutboundCap};
use crate::pipeline::{EmbargoTable, PendingCallQueue};
use crate::threeparty::{self, JoinTable, ProvideTable};
use crate::transport::{CallParams, Handler, Transport};

pub type QuestionId = u32;
pub type AnswerId = u32;

struct Question {
    param_export_ids: Vec<ExportId>,
    returned: bool,
    /// The `Return.which` payload once it has arrived. There is no
    /// `Handler`-side callback for our own outstanding questions (the
    /// `Handler` trait only covers inbound calls against local exports), so
    /// an embedder retrieves a question's result by polling
    /// [`Peer::take_return`].
    result: Option<ReturnWhich>,
}

struct Answer {
    result_export_ids: Vec<ExportId>,
    returned: bool,
    finished: bool,
}

struct Inner {
    config: PeerConfig,
    transport: Box<dyn Transport>,
    cap_table: CapTable,
    questions: BTreeMap<QuestionId, Question>,
    answers: BTreeMap<AnswerId, Answer>,
    next_question_id: QuestionId,
    pending_calls: PendingCallQueue,
    /// Calls queued against one of our own promise-exports, keyed by the
    /// export id, until `resolve_promise_export`/`break_promise_export`
    /// drains them (§4.7.1, §4.8.1).
    pending_export_promises: BTreeMap<ExportId, Vec<Call>>,
    embargoes: EmbargoTable,
    provisions: ProvideTable,
    joins: JoinTable,
    /// `Accept`s parked behind an embargo token, released by a matching
    /// `Disembargo(accept, token)` (§4.8.3).
    pending_accepts_by_embargo: BTreeMap<String, Vec<(AnswerId, ExportId)>>,
    /// Reverse index so a `Finish` on a parked accept's own question can
    /// find (and silently drop) its parked entry.
    pending_accept_embargo_by_question: BTreeMap<AnswerId, String>,
    /// `Return.awaitFromThirdParty` tokens we are holding one of our own
    /// questions open for, keyed by the completion key, until a matching
    /// `ThirdPartyAnswer` arrives (§4.8.5).
    pending_third_party_awaits: BTreeMap<String, QuestionId>,
    /// The mirror image: a `ThirdPartyAnswer` arrived before the `Return`
    /// that names its completion key.
    pending_third_party_answers: BTreeMap<String, AnswerId>,
    /// `Return`s that arrived addressed to a third-party answer id before
    /// that id was adopted onto one of our real questions.
    pending_third_party_returns: BTreeMap<AnswerId, ReturnWhich>,
    /// Once a `ThirdPartyAnswer` and its `Return.awaitFromThirdParty` have
    /// been paired, maps the synthetic third-party answer id to the real
    /// question id a later `Return(answer_id = that id)` should resolve.
    adopted_third_party_answers: BTreeMap<AnswerId, QuestionId>,
    aborted: bool,
}

/// A cheaply-cloned handle to one peer. All clones share the same
/// underlying state; there is no meaningful notion of "the last clone"
/// being special.
pub struct Peer {
    inner: Rc<RefCell<Inner>>,
    handler: Rc<dyn Handler>,
}

impl Clone for Peer {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl Peer {
    pub fn new(config: PeerConfig, transport: Box<dyn Transport>, handler: Rc<dyn Handler>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                cap_table: CapTable::new(config.max_cap_table_entries),
                config,
                transport,
                questions: Default::default(),
                answers: Default::default(),
                next_question_id: 0,
                pending_calls: PendingCallQueue::default(),
                pending_export_promises: Default::default(),
                embargoes: EmbargoTable::default(),
                provisions: ProvideTable::default(),
                joins: JoinTable::default(),
                pending_accepts_by_embargo: Default::default(),
                pending_accept_embargo_by_question: Default::default(),
                pending_third_party_awaits: Default::default(),
                pending_third_party_answers: Default::default(),
                pending_third_party_returns: Default::default(),
                adopted_third_party_answers: Default::default(),
                aborted: false,
            })),
            handler,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    fn send_message(&self, msg: &Message) -> Result<()> {
        let encoded = peer_wire::encode_message(&msg.encode())?;
        self.inner.borrow_mut().transport.send(&encoded)?;
        Ok(())
    }

    fn abort(&self, err: &PeerError) {
        let already = {
            let mut inner = self.inner.borrow_mut();
            let was = inner.aborted;
            inner.aborted = true;
            was
        };
        if already {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::error!("aborting connection: {}", err);
        let _ = self.send_message(&Message::Abort(err.to_exception()));
    }

    // -------------------------------------------------------------
    // Inbound dispatch
    // -------------------------------------------------------------

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub fn handle_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_aborted() {
            return Err(PeerError::state(PeerErrorKind::AlreadyAborted));
        }
        match self.try_handle_frame(frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    fn try_handle_frame(&self, frame: &[u8]) -> Result<()> {
        let limits = self.inner.borrow().config.reader_limits;
        let any = peer_wire::decode_message_with_limits(frame, &limits)?;
        let message = Message::decode(&any)?;
        match message {
            Message::Unimplemented(_inner) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("peer reported a message as unimplemented");
                Ok(())
            }
            Message::Abort(exc) => {
                self.inner.borrow_mut().aborted = true;
                Err(PeerError::state(PeerErrorKind::RemoteAbort(exc.reason)))
            }
            Message::Bootstrap(b) => self.handle_bootstrap(b),
            Message::Call(c) => self.handle_call(c),
            Message::Return(r) => self.handle_return(r),
            Message::Finish(f) => self.handle_finish(f),
            Message::Resolve(r) => self.handle_resolve(r),
            Message::Release(r) => self.handle_release(r),
            Message::Disembargo(d) => self.handle_disembargo(d),
            Message::Provide(p) => self.handle_provide(p),
            Message::Accept(a) => self.handle_accept(a),
            Message::Join(j) => self.handle_join(j),
            Message::ThirdPartyAnswer(t) => self.handle_third_party_answer(t),
        }
    }

    fn handle_bootstrap(&self, b: Bootstrap) -> Result<()> {
        let answer_id: AnswerId = b.question_id;
        let export_id = self.handler.bootstrap(self);
        let encoded = {
            let mut inner = self.inner.borrow_mut();
            if inner.answers.contains_key(&answer_id) {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(answer_id)));
            }
            inner.cap_table.register_or_ref_export(export_id)?;
            let is_promise = inner.cap_table.export_is_promise(export_id)?;
            outbound::encode_payload(AnyValue::Capability(export_id), |id| {
                Ok(OutboundCap {
                    descriptor: if is_promise {
                        CapDescriptor::SenderPromise(id)
                    } else {
                        CapDescriptor::SenderHosted(id)
                    },
                    consume_answer: None,
                })
            })?
        };
        consume_answers(&mut self.inner.borrow_mut(), &encoded.to_consume);
        self.inner.borrow_mut().answers.insert(
            answer_id,
            Answer {
                result_export_ids: vec![export_id],
                returned: true,
                finished: false,
            },
        );
        self.send_message(&Message::Return(Return {
            answer_id,
            release_param_caps: true,
            which: ReturnWhich::Results(Payload {
                content: encoded.content,
                cap_table: encoded.cap_table,
            }),
        }))?;
        self.drain_and_replay_pipelined(answer_id, Some(export_id));
        Ok(())
    }

    fn handle_call(&self, c: Call) -> Result<()> {
        let answer_id = c.question_id;
        // `target = promisedAnswer(q, ops)` pipelines this call onto the
        // eventual result of question `q` *that the sender of this Call
        // itself asked* — from our side, that is one of our own `answers`
        // entries (we are the one who will eventually return it), not one
        // of our own `questions`. If that answer hasn't returned yet, queue
        // the call; if it already has, resolve straight to the capability
        // it returned (this only disambiguates a single-capability result,
        // same limitation as `drain_and_replay_pipelined`).
        let export_id = match &c.target {
            MessageTarget::ImportedCap(id) => *id,
            MessageTarget::PromisedAnswer(pa) => {
                let pa_question_id = pa.question_id;
                let resolved = {
                    let inner = self.inner.borrow();
                    let answer = inner.answers.get(&pa_question_id);
                    match answer {
                        Some(a) if !a.returned => None,
                        Some(a) => Some(a.result_export_ids.first().copied()),
                        None => {
                            return Err(PeerError::Wire(peer_wire::Error::missing_call_target(format!(
                                "promisedAnswer {pa_question_id} does not name an answer we are producing"
                            ))))
                        }
                    }
                };
                match resolved {
                    None => {
                        self.inner.borrow_mut().pending_calls.enqueue(pa_question_id, c);
                        return Ok(());
                    }
                    Some(Some(id)) => id,
                    Some(None) => {
                        let mut inner = self.inner.borrow_mut();
                        if !inner.answers.contains_key(&answer_id) {
                            inner.answers.insert(
                                answer_id,
                                Answer {
                                    result_export_ids: vec![],
                                    returned: false,
                                    finished: false,
                                },
                            );
                        }
                        drop(inner);
                        return self.send_return_exception(
                            answer_id,
                            Exception {
                                kind: ExceptionType::Failed,
                                reason: format!("promisedAnswer {pa_question_id} did not resolve to a capability"),
                            },
                        );
                    }
                }
            }
        };

        let c = {
            let mut inner = self.inner.borrow_mut();
            if !inner.cap_table.export_exists(export_id) {
                return Err(PeerError::Wire(peer_wire::Error::missing_call_target(format!(
                    "export {export_id}"
                ))));
            }
            if inner.answers.contains_key(&answer_id) {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(answer_id)));
            }
            // A call against a target still behind a disembargo must wait
            // for the disembargo to clear so it cannot overtake the calls
            // the embargo exists to order against (§4.8.2).
            if let Some(embargo_id) = inner.embargoes.embargo_for_target(export_id) {
                inner.embargoes.enqueue(embargo_id, c);
                return Ok(());
            }
            // A call against one of our own promise-exports is queued until
            // the embedder resolves or breaks it (§4.7.1, §4.8.1).
            if inner.cap_table.export_is_promise(export_id)? {
                inner.pending_export_promises.entry(export_id).or_default().push(c);
                return Ok(());
            }
            c
        };

        let cap_table = c.params.cap_table.clone();
        let content = {
            let mut inner = self.inner.borrow_mut();
            inbound::decode_payload(c.params.content, &cap_table, |d| resolve_inbound_cap(&mut inner.cap_table, d))?
        };
        let cap_ids = collect_cap_ids(&cap_table);

        self.inner.borrow_mut().answers.insert(
            answer_id,
            Answer {
                result_export_ids: vec![],
                returned: false,
                finished: false,
            },
        );

        self.handler.on_call(
            self,
            answer_id,
            export_id,
            c.interface_id,
            c.method_id,
            CallParams { content, cap_ids },
        );
        Ok(())
    }

    fn handle_return(&self, r: Return) -> Result<()> {
        let Return {
            answer_id,
            release_param_caps,
            which,
        } = r;
        let mut answer_id = answer_id;

        // A third-party answer id is only meaningful once adopted onto one
        // of our real questions; until then, buffer the result (§4.8.5).
        if rpc::is_third_party_answer_id(answer_id) {
            let mut inner = self.inner.borrow_mut();
            if let Some(&original) = inner.adopted_third_party_answers.get(&answer_id) {
                answer_id = original;
            } else {
                let stored_which = remap_return_payload(&mut inner.cap_table, which)?;
                inner.pending_third_party_returns.insert(answer_id, stored_which);
                return Ok(());
            }
        }

        let mut inner = self.inner.borrow_mut();
        {
            let question = inner
                .questions
                .get(&answer_id)
                .ok_or(PeerErrorKind::UnknownQuestion(answer_id))?;
            if question.returned {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(answer_id)));
            }
        }

        // Results carry a wire-level cap table, same as a Call's params;
        // re-map it through the same inbound path so any capabilities the
        // answer resolved to become tracked imports before the caller sees
        // them.
        let stored_which = remap_return_payload(&mut inner.cap_table, which)?;

        if let ReturnWhich::AwaitFromThirdParty(token) = &stored_which {
            let key = threeparty::token_key(token)?;
            if let Some(third_party_id) = inner.pending_third_party_answers.remove(&key) {
                inner.adopted_third_party_answers.insert(third_party_id, answer_id);
                if let Some(buffered) = inner.pending_third_party_returns.remove(&third_party_id) {
                    let question = inner.questions.get_mut(&answer_id).unwrap();
                    question.returned = true;
                    question.result = Some(buffered);
                    return Ok(());
                }
            } else {
                inner.pending_third_party_awaits.insert(key, answer_id);
            }
            return Ok(());
        }

        let is_exception = matches!(stored_which, ReturnWhich::Exception(_));

        let question = inner.questions.get_mut(&answer_id).unwrap();
        question.returned = true;
        question.result = Some(stored_which);

        if release_param_caps {
            let ids = std::mem::take(&mut question.param_export_ids);
            for id in ids {
                inner.cap_table.release_export(id, 1)?;
            }
        }

        if is_exception {
            #[cfg(feature = "tracing")]
            tracing::debug!(question_id = answer_id, "question returned exception");
        }
        Ok(())
    }

    /// Re-dispatches a call (already retargeted at a concrete export, or
    /// whose embargo/promise-export has just cleared) by running it back
    /// through the normal inbound path.
    fn replay_pipelined_call(&self, call: Call) {
        if let Err(e) = self.handle_call(call) {
            self.abort(&e);
        }
    }

    /// Drains every call queued against `answer_id` (via a `promisedAnswer`
    /// target naming it) now that we are about to answer it, and replays
    /// each against `resolved_export` — the single capability `answer_id`'s
    /// result resolved to, if any (§4.8.1). Calls whose `transform` selects
    /// a different field of a multi-capability result are not disambiguated
    /// further; they are retargeted at the same single resolved export.
    /// When the answer carried no capability (an exception, or a result
    /// with none), every queued call is answered with an exception instead.
    fn drain_and_replay_pipelined(&self, answer_id: AnswerId, resolved_export: Option<ExportId>) {
        let queued = self.inner.borrow_mut().pending_calls.drain(answer_id);
        for mut call in queued {
            match resolved_export {
                Some(export_id) => {
                    call.target = MessageTarget::ImportedCap(export_id);
                    self.replay_pipelined_call(call);
                }
                None => {
                    let pipelined_id = call.question_id;
                    {
                        let mut inner = self.inner.borrow_mut();
                        if !inner.answers.contains_key(&pipelined_id) {
                            inner.answers.insert(
                                pipelined_id,
                                Answer {
                                    result_export_ids: vec![],
                                    returned: false,
                                    finished: false,
                                },
                            );
                        }
                    }
                    let _ = self.send_return_exception(
                        pipelined_id,
                        Exception {
                            kind: ExceptionType::Failed,
                            reason: "pipelined target did not resolve to a capability".into(),
                        },
                    );
                }
            }
        }
    }

    fn handle_finish(&self, f: Finish) -> Result<()> {
        let mut inner = self.inner.borrow_mut();

        // A Finish on a Provide's own question retracts that offer; any
        // Accept still in flight for it will see "unknown provision".
        if inner.provisions.remove_by_question(f.question_id) {
            return Ok(());
        }

        // A Finish on a parked Accept drops it silently rather than leaving
        // a dangling Return to send once the disembargo arrives.
        if let Some(key) = inner.pending_accept_embargo_by_question.remove(&f.question_id) {
            if let Some(parked) = inner.pending_accepts_by_embargo.get_mut(&key) {
                parked.retain(|(question_id, _)| *question_id != f.question_id);
                if parked.is_empty() {
                    inner.pending_accepts_by_embargo.remove(&key);
                }
            }
        }

        let answer = inner
            .answers
            .get_mut(&f.question_id)
            .ok_or(PeerErrorKind::UnknownAnswer(f.question_id))?;
        if answer.finished {
            return Err(PeerError::state(PeerErrorKind::QuestionAlreadyFinished(f.question_id)));
        }
        answer.finished = true;
        if f.release_result_caps {
            let ids = std::mem::take(&mut answer.result_export_ids);
            for id in ids {
                inner.cap_table.release_export(id, 1)?;
            }
        }
        if answer.returned {
            inner.answers.remove(&f.question_id);
        }
        Ok(())
    }

    fn handle_resolve(&self, r: Resolve) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.cap_table.import_exists(r.promise_id) {
            // Unknown promise id: nothing to resolve, ignore per §4.9.
            return Ok(());
        }
        match r.which {
            ResolveWhich::Cap(descriptor) => {
                inner.cap_table.resolve_import(r.promise_id)?;
                // A resolution naming something the far side hosts (or one of
                // its own promises) opens a new route to the capability; calls
                // we already pipelined over the old promise path might still
                // be in flight the "long way round", so an embargo is required
                // until a disembargo confirms they've all drained (§4.7.2,
                // §4.8.2). A resolution naming something *we* already host, or
                // one of our own answers, is already concrete from our side
                // and needs no such ordering guard.
                let needs_embargo = matches!(
                    descriptor,
                    CapDescriptor::SenderHosted(_) | CapDescriptor::SenderPromise(_)
                );
                if needs_embargo {
                    let embargo_id = inner.embargoes.raise_for_target(r.promise_id);
                    drop(inner);
                    self.send_message(&Message::Disembargo(Disembargo {
                        target: MessageTarget::ImportedCap(r.promise_id),
                        context: DisembargoContext::SenderLoopback(embargo_id),
                    }))?;
                }
            }
            ResolveWhich::Exception(_) => {
                // The promise resolved to an error; nothing further to track
                // beyond clearing its promise marker so a later `Release`
                // isn't rejected as referring to an unresolved promise.
                inner.cap_table.resolve_import(r.promise_id)?;
            }
        }
        Ok(())
    }

    fn handle_release(&self, r: Release) -> Result<()> {
        self.inner.borrow_mut().cap_table.release_export(r.id, r.reference_count)?;
        Ok(())
    }

    fn handle_disembargo(&self, d: Disembargo) -> Result<()> {
        match d.context {
            DisembargoContext::ReceiverLoopback(embargo_id) => {
                let released = self
                    .inner
                    .borrow_mut()
                    .embargoes
                    .release(embargo_id)
                    .ok_or(PeerErrorKind::UnknownEmbargo(embargo_id))?;
                for call in released {
                    self.replay_pipelined_call(call);
                }
                Ok(())
            }
            DisembargoContext::SenderLoopback(embargo_id) => {
                // Per §4.7.2, verify the target is a capability we actually
                // host before trusting the loopback and echoing it back.
                let known = match &d.target {
                    MessageTarget::ImportedCap(id) => self.inner.borrow().cap_table.export_exists(*id),
                    MessageTarget::PromisedAnswer(_) => false,
                };
                if !known {
                    return Err(PeerError::state(PeerErrorKind::UnknownDisembargoTarget));
                }
                self.send_message(&Message::Disembargo(Disembargo {
                    target: d.target,
                    context: DisembargoContext::ReceiverLoopback(embargo_id),
                }))
            }
            DisembargoContext::Accept(token) => self.release_parked_accepts(&token),
            // The reverse-direction "provide" embargo concerns a second
            // connection to the third-party vat that received our provided
            // capability; this peer only ever speaks to one remote, so
            // there is nothing local to release here.
            DisembargoContext::Provide(_) => Ok(()),
        }
    }

    fn release_parked_accepts(&self, token: &AnyValue) -> Result<()> {
        let key = threeparty::token_key(token)?;
        let parked = {
            let mut inner = self.inner.borrow_mut();
            let parked = inner.pending_accepts_by_embargo.remove(&key).unwrap_or_default();
            for (answer_id, _) in &parked {
                inner.pending_accept_embargo_by_question.remove(answer_id);
            }
            parked
        };
        for (answer_id, target_export_id) in parked {
            self.send_return_with_export(answer_id, target_export_id)?;
        }
        Ok(())
    }

    fn handle_provide(&self, p: Provide) -> Result<()> {
        let export_id = match p.target {
            MessageTarget::ImportedCap(id) => id,
            MessageTarget::PromisedAnswer(_) => {
                return Err(PeerError::Wire(peer_wire::Error::missing_call_target(
                    "provide of a pipelined target is not supported",
                )))
            }
        };
        self.inner.borrow_mut().provisions.offer(p.question_id, export_id, &p.recipient)?;
        Ok(())
    }

    fn handle_accept(&self, a: Accept) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.answers.contains_key(&a.question_id) {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(a.question_id)));
            }
            inner.answers.insert(
                a.question_id,
                Answer {
                    result_export_ids: vec![],
                    returned: false,
                    finished: false,
                },
            );
        }

        let target_export_id = self.inner.borrow_mut().provisions.fulfill(&a.provision);
        let target_export_id = match target_export_id {
            Some(id) => id,
            None => {
                return self.send_return_exception(
                    a.question_id,
                    Exception {
                        kind: ExceptionType::Failed,
                        reason: "unknown provision".into(),
                    },
                );
            }
        };

        match a.embargo {
            None => self.send_return_with_export(a.question_id, target_export_id),
            Some(token) => {
                let key = threeparty::token_key(&token)?;
                let mut inner = self.inner.borrow_mut();
                inner
                    .pending_accepts_by_embargo
                    .entry(key.clone())
                    .or_default()
                    .push((a.question_id, target_export_id));
                inner.pending_accept_embargo_by_question.insert(a.question_id, key);
                Ok(())
            }
        }
    }

    fn handle_join(&self, j: Join) -> Result<()> {
        let export_id = match j.target {
            MessageTarget::ImportedCap(id) => id,
            MessageTarget::PromisedAnswer(_) => {
                return Err(PeerError::Wire(peer_wire::Error::missing_call_target(
                    "join of a pipelined target is not supported",
                )))
            }
        };
        {
            let mut inner = self.inner.borrow_mut();
            if inner.answers.contains_key(&j.question_id) {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(j.question_id)));
            }
            inner.answers.insert(
                j.question_id,
                Answer {
                    result_export_ids: vec![],
                    returned: false,
                    finished: false,
                },
            );
        }
        let completed = self.inner.borrow_mut().joins.add_part(
            j.key_part.join_id,
            j.key_part.part_count,
            j.key_part.part_num,
            j.question_id,
            export_id,
        )?;
        if let Some(legs) = completed {
            for (question_id, target_export_id) in legs {
                self.send_return_with_export(question_id, target_export_id)?;
            }
        }
        Ok(())
    }

    fn handle_third_party_answer(&self, t: ThirdPartyAnswer) -> Result<()> {
        if !rpc::is_third_party_answer_id(t.question_id) {
            return Err(PeerError::state(PeerErrorKind::InvalidThirdPartyAnswerId(t.question_id)));
        }
        let key = threeparty::token_key(&t.completion)?;
        let mut inner = self.inner.borrow_mut();
        if let Some(original) = inner.pending_third_party_awaits.remove(&key) {
            inner.adopted_third_party_answers.insert(t.question_id, original);
            if let Some(buffered) = inner.pending_third_party_returns.remove(&t.question_id) {
                let question = inner
                    .questions
                    .get_mut(&original)
                    .ok_or(PeerErrorKind::UnknownQuestion(original))?;
                question.returned = true;
                question.result = Some(buffered);
            }
        } else {
            inner.pending_third_party_answers.insert(key, t.question_id);
        }
        Ok(())
    }

    // -------------------------------------------------------------
    // Outbound operations
    // -------------------------------------------------------------

    /// Picks an id not currently in use by a live question. Probes forward
    /// from `next_question_id`, wrapping on overflow; if the full 2^32 id
    /// space is occupied by live questions it gives up rather than return a
    /// duplicate.
    fn alloc_question_id(&self) -> Result<QuestionId> {
        let mut inner = self.inner.borrow_mut();
        let start = inner.next_question_id;
        loop {
            let id = inner.next_question_id;
            inner.next_question_id = inner.next_question_id.wrapping_add(1);
            if !inner.questions.contains_key(&id) {
                return Ok(id);
            }
            if inner.next_question_id == start {
                return Err(PeerError::state(PeerErrorKind::QuestionIdExhausted));
            }
        }
    }

    pub fn send_bootstrap(&self) -> Result<QuestionId> {
        let question_id = self.alloc_question_id()?;
        self.inner.borrow_mut().questions.insert(
            question_id,
            Question {
                param_export_ids: vec![],
                returned: false,
                result: None,
            },
        );
        self.send_message(&Message::Bootstrap(Bootstrap {
            question_id,
            deprecated_object_id: AnyValue::Null,
        }))?;
        Ok(question_id)
    }

    pub fn call(
        &self,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        content: AnyValue,
        resolve: impl FnMut(ExportId) -> peer_wire::Result<OutboundCap>,
    ) -> Result<QuestionId> {
        let encoded = outbound::encode_payload(content, resolve)?;
        consume_answers(&mut self.inner.borrow_mut(), &encoded.to_consume);
        let param_export_ids = param_export_ids_from(&encoded.cap_table);
        let question_id = self.alloc_question_id()?;
        self.inner.borrow_mut().questions.insert(
            question_id,
            Question {
                param_export_ids,
                returned: false,
                result: None,
            },
        );
        self.send_message(&Message::Call(Call {
            question_id,
            target,
            interface_id,
            method_id,
            params: Payload {
                content: encoded.content,
                cap_table: encoded.cap_table,
            },
            send_results_to: SendResultsTo::Caller,
            allow_third_party_tail_call: false,
        }))?;
        Ok(question_id)
    }

    pub fn send_return_results(
        &self,
        answer_id: AnswerId,
        content: AnyValue,
        resolve: impl FnMut(ExportId) -> peer_wire::Result<OutboundCap>,
    ) -> Result<()> {
        let encoded = outbound::encode_payload(content, resolve)?;
        consume_answers(&mut self.inner.borrow_mut(), &encoded.to_consume);
        let result_export_ids = param_export_ids_from(&encoded.cap_table);
        let resolved_export = result_export_ids.first().copied();
        {
            let mut inner = self.inner.borrow_mut();
            let answer = inner
                .answers
                .get_mut(&answer_id)
                .ok_or(PeerErrorKind::UnknownAnswer(answer_id))?;
            if answer.returned {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(answer_id)));
            }
            answer.returned = true;
            answer.result_export_ids = result_export_ids;
            let finished = answer.finished;
            if finished {
                inner.answers.remove(&answer_id);
            }
        }
        self.send_message(&Message::Return(Return {
            answer_id,
            release_param_caps: true,
            which: ReturnWhich::Results(Payload {
                content: encoded.content,
                cap_table: encoded.cap_table,
            }),
        }))?;
        self.drain_and_replay_pipelined(answer_id, resolved_export);
        Ok(())
    }

    /// Sends `Return.results(senderHosted(export_id))` for `answer_id`,
    /// adding a reference to `export_id` for the newly-shared answer. Used
    /// for the handler-free completions `Accept` and `Join` produce, where
    /// the result is always exactly the capability the peer already hosts.
    fn send_return_with_export(&self, answer_id: AnswerId, export_id: ExportId) -> Result<()> {
        let encoded = {
            let mut inner = self.inner.borrow_mut();
            inner.cap_table.export_ref(export_id)?;
            outbound::encode_payload(AnyValue::Capability(export_id), |id| {
                Ok(OutboundCap {
                    descriptor: CapDescriptor::SenderHosted(id),
                    consume_answer: None,
                })
            })?
        };
        consume_answers(&mut self.inner.borrow_mut(), &encoded.to_consume);
        {
            let mut inner = self.inner.borrow_mut();
            let answer = inner
                .answers
                .get_mut(&answer_id)
                .ok_or(PeerErrorKind::UnknownAnswer(answer_id))?;
            if answer.returned {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(answer_id)));
            }
            answer.returned = true;
            answer.result_export_ids = vec![export_id];
            let finished = answer.finished;
            if finished {
                inner.answers.remove(&answer_id);
            }
        }
        self.send_message(&Message::Return(Return {
            answer_id,
            release_param_caps: true,
            which: ReturnWhich::Results(Payload {
                content: encoded.content,
                cap_table: encoded.cap_table,
            }),
        }))?;
        self.drain_and_replay_pipelined(answer_id, Some(export_id));
        Ok(())
    }

    pub fn send_return_exception(&self, answer_id: AnswerId, exception: Exception) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let answer = inner
                .answers
                .get_mut(&answer_id)
                .ok_or(PeerErrorKind::UnknownAnswer(answer_id))?;
            if answer.returned {
                return Err(PeerError::state(PeerErrorKind::AnswerAlreadyReturned(answer_id)));
            }
            answer.returned = true;
            let finished = answer.finished;
            if finished {
                inner.answers.remove(&answer_id);
            }
        }
        self.send_message(&Message::Return(Return {
            answer_id,
            release_param_caps: true,
            which: ReturnWhich::Exception(exception),
        }))?;
        self.drain_and_replay_pipelined(answer_id, None);
        Ok(())
    }

    pub fn send_return_canceled(&self, answer_id: AnswerId) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let answer = inner
                .answers
                .get_mut(&answer_id)
                .ok_or(PeerErrorKind::UnknownAnswer(answer_id))?;
            answer.returned = true;
        }
        self.send_message(&Message::Return(Return {
            answer_id,
            release_param_caps: true,
            which: ReturnWhich::Canceled,
        }))?;
        self.drain_and_replay_pipelined(answer_id, None);
        Ok(())
    }

    /// Takes the `Return.which` payload for `question_id` if it has arrived,
    /// leaving the question's bookkeeping (needed for a later `finish`)
    /// otherwise untouched.
    pub fn take_return(&self, question_id: QuestionId) -> Option<ReturnWhich> {
        self.inner
            .borrow_mut()
            .questions
            .get_mut(&question_id)
            .and_then(|q| q.result.take())
    }

    pub fn finish(&self, question_id: QuestionId, release_result_caps: bool) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let question = inner
                .questions
                .get(&question_id)
                .ok_or(PeerErrorKind::UnknownQuestion(question_id))?;
            if question.returned {
                inner.questions.remove(&question_id);
            }
        }
        self.send_message(&Message::Finish(Finish {
            question_id,
            release_result_caps,
            require_early_cancellation: false,
        }))
    }

    pub fn release_import(&self, import_id: ImportId, count: u32) -> Result<()> {
        self.inner.borrow_mut().cap_table.release_import(import_id, count)?;
        self.send_message(&Message::Release(Release {
            id: import_id,
            reference_count: count,
        }))
    }

    /// Allocates a promise export: a capability id we have told the remote
    /// about that has not settled to a concrete destination yet. Calls
    /// against it are queued until [`Peer::resolve_promise_export`] or
    /// [`Peer::break_promise_export`] is called (§4.7.1, §4.8.1).
    pub fn add_promise_export(&self) -> Result<ExportId> {
        self.inner.borrow_mut().cap_table.alloc_export(true)
    }

    /// Settles a promise export in place, notifies the remote via `Resolve`
    /// (§4.7.2) so it can embargo its own pipelined traffic, and replays
    /// every call that was queued locally against it while it was
    /// unresolved.
    pub fn resolve_promise_export(&self, export_id: ExportId) -> Result<()> {
        let queued = {
            let mut inner = self.inner.borrow_mut();
            inner.cap_table.resolve_export(export_id)?;
            inner.pending_export_promises.remove(&export_id).unwrap_or_default()
        };
        self.send_message(&Message::Resolve(Resolve {
            promise_id: export_id,
            which: ResolveWhich::Cap(CapDescriptor::SenderHosted(export_id)),
        }))?;
        for call in queued {
            self.replay_pipelined_call(call);
        }
        Ok(())
    }

    /// Tells the remote the promise broke via `Resolve.exception` and
    /// answers every call queued locally against `export_id` with `reason`
    /// instead of ever settling it.
    pub fn break_promise_export(&self, export_id: ExportId, reason: Exception) -> Result<()> {
        let queued = self.inner.borrow_mut().pending_export_promises.remove(&export_id).unwrap_or_default();
        self.send_message(&Message::Resolve(Resolve {
            promise_id: export_id,
            which: ResolveWhich::Exception(reason.clone()),
        }))?;
        for call in queued {
            let answer_id = call.question_id;
            {
                let mut inner = self.inner.borrow_mut();
                if !inner.answers.contains_key(&answer_id) {
                    inner.answers.insert(
                        answer_id,
                        Answer {
                            result_export_ids: vec![],
                            returned: false,
                            finished: false,
                        },
                    );
                }
            }
            self.send_return_exception(answer_id, reason.clone())?;
        }
        Ok(())
    }

    pub fn provide(&self, target: MessageTarget, recipient: AnyValue) -> Result<QuestionId> {
        let question_id = self.alloc_question_id()?;
        self.send_message(&Message::Provide(Provide {
            question_id,
            target,
            recipient,
        }))?;
        Ok(question_id)
    }

    pub fn accept(&self, provision: AnyValue, embargo: Option<AnyValue>) -> Result<QuestionId> {
        let question_id = self.alloc_question_id()?;
        self.inner.borrow_mut().questions.insert(
            question_id,
            Question {
                param_export_ids: vec![],
                returned: false,
                result: None,
            },
        );
        self.send_message(&Message::Accept(Accept {
            question_id,
            embargo,
            provision,
        }))?;
        Ok(question_id)
    }

    pub fn raise_embargo(&self, target: MessageTarget) -> Result<u32> {
        let export_id = match target {
            MessageTarget::ImportedCap(id) => id,
            MessageTarget::PromisedAnswer(_) => return Err(PeerError::state(PeerErrorKind::MissingCallTarget)),
        };
        let embargo_id = self.inner.borrow_mut().embargoes.raise_for_target(export_id);
        self.send_message(&Message::Disembargo(Disembargo {
            target: MessageTarget::ImportedCap(export_id),
            context: DisembargoContext::SenderLoopback(embargo_id),
        }))?;
        Ok(embargo_id)
    }

    pub fn join(&self, target: MessageTarget, join_id: u32, part_count: u16, part_num: u16, part: AnyValue) -> Result<QuestionId> {
        let question_id = self.alloc_question_id()?;
        self.inner.borrow_mut().questions.insert(
            question_id,
            Question {
                param_export_ids: vec![],
                returned: false,
                result: None,
            },
        );
        self.send_message(&Message::Join(Join {
            question_id,
            target,
            key_part: JoinKeyPart {
                join_id,
                part_count,
                part_num,
                part,
            },
        }))?;
        Ok(question_id)
    }
}

fn consume_answers(inner: &mut Inner, to_consume: &[u32]) {
    for id in to_consume {
        inner.answers.remove(id);
    }
}

fn remap_return_payload(cap_table: &mut CapTable, which: ReturnWhich) -> peer_wire::Result<ReturnWhich> {
    Ok(match which {
        ReturnWhich::Results(payload) => {
            let cap_table_descriptors = payload.cap_table;
            let content = inbound::decode_payload(payload.content, &cap_table_descriptors, |d| {
                resolve_inbound_cap(cap_table, d)
            })?;
            ReturnWhich::Results(Payload {
                content,
                cap_table: cap_table_descriptors,
            })
        }
        other => other,
    })
}

fn collect_cap_ids(cap_table: &[CapDescriptor]) -> Vec<ImportId> {
    cap_table
        .iter()
        .map(|d| match d {
            CapDescriptor::None => 0,
            CapDescriptor::SenderHosted(id)
            | CapDescriptor::SenderPromise(id)
            | CapDescriptor::ReceiverHosted(id) => *id,
            CapDescriptor::ReceiverAnswer(pa) => pa.question_id,
            CapDescriptor::ThirdPartyHosted { id, .. } => *id,
        })
        .collect()
}

fn param_export_ids_from(cap_table: &[CapDescriptor]) -> Vec<ExportId> {
    cap_table
        .iter()
        .filter_map(|d| match d {
            CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => Some(*id),
            _ => None,
        })
        .collect()
}

fn resolve_inbound_cap(cap_table: &mut CapTable, d: &CapDescriptor) -> peer_wire::Result<ImportId> {
    match d {
        CapDescriptor::None => Err(peer_wire::Error::missing_cap_descriptor_id("none descriptor")),
        CapDescriptor::SenderHosted(id) => {
            cap_table
                .import_ref_new(*id, false)
                .map_err(|e| peer_wire::Error::missing_cap_descriptor_id(e.to_string()))?;
            Ok(*id)
        }
        CapDescriptor::SenderPromise(id) => {
            cap_table
                .import_ref_new(*id, true)
                .map_err(|e| peer_wire::Error::missing_cap_descriptor_id(e.to_string()))?;
            Ok(*id)
        }
        CapDescriptor::ReceiverHosted(id) => Ok(*id),
        CapDescriptor::ReceiverAnswer(pa) => Ok(pa.question_id),
        CapDescriptor::ThirdPartyHosted { id, .. } => Ok(*id),
    }
}
