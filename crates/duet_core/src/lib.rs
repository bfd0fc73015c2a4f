/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The wire-format-independent heart of Duet: turn envelopes, the per-pair
//! rendezvous [`Session`][session::Session], and the [`SessionManager`][manager::SessionManager]
//! directory that owns every live session.

pub mod envelope;
pub mod manager;
pub mod session;

pub mod settings;
