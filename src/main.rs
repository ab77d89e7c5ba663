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

use std::env::args;
use std::process::exit;

use shannon::compiler;

fn main() {
    env_logger::init();

    let path = args().nth(1).unwrap_or_else(|| "z.sn".to_string());
    let mut out = std::io::stdout();
    if let Err(e) = compiler::run_file(&path, &mut out) {
        eprintln!("{}", e);
        exit(1);
    }
}
