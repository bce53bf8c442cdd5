/*
Copyright 2021 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use qgrep::plan::OutputMode;

mod cli;

fn main() {
    reset_signal_pipe_handler();

    let args = cli::parse_arguments();

    let (plan, inputs) = cli::build_plan(args).unwrap_or_else(|msg| {
        eprintln!("qgrep: {}", msg);
        std::process::exit(2)
    });

    let quiet = plan.mode == OutputMode::Quiet;

    match qgrep::run(plan, inputs) {
        Ok(summary) => {
            // 0 on match, 1 on no match, >1 on error; quiet mode
            // reports a match even when warnings piled up
            let code = if summary.matched && quiet {
                0
            } else if summary.warnings > 0 {
                2
            } else if summary.matched {
                0
            } else {
                1
            };
            std::process::exit(code)
        }
        Err(e) => {
            eprintln!("qgrep: {}", e);
            std::process::exit(2)
        }
    }
}

// Exit on SIGPIPE
// see https://github.com/rust-lang/rust/issues/46016#issuecomment-605624865
fn reset_signal_pipe_handler() {
    #[cfg(target_family = "unix")]
    {
        use nix::sys::signal;

        unsafe {
            let _ = signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigDfl)
                .map_err(|e| eprintln!("{}", e));
        }
    }
}
