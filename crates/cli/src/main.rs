//! The `toolbox` binary. All real logic lives in `toolbox-lib`;
//! this is just the entrypoint.

fn main() {
    toolbox_utils::run_main(|| toolbox_lib::cli::run_from_iter(std::env::args_os()))
}
