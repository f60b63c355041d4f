#![forbid(unsafe_code)]

fn main() {
    // Values printed in the startup banner.
    build_data::set_GIT_BRANCH();
    build_data::set_GIT_COMMIT_SHORT();
    build_data::set_GIT_DIRTY();
    build_data::set_SOURCE_TIMESTAMP();  // BUILD_TIMESTAMP would make the build unreproducible.
    build_data::set_RUSTC_VERSION();

    // The production template is embedded with include_str!.
    println!("cargo:rerun-if-changed=templates/hello.tmpl.html");
}
