// Shannon: a small statically-typed scripting language with a
// constant-folding compiler and a stack-based bytecode VM.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate enumflags2;
extern crate env_logger;
extern crate log;
extern crate num_enum;
extern crate thiserror;
#[macro_use]
extern crate lazy_static;


#[macro_use]
pub mod util;

pub mod buf;
pub mod charset;
pub mod codegen;
pub mod compiler;
pub mod error;
pub mod scope;
pub mod source;
pub mod types;
pub mod value;
pub mod vm;
