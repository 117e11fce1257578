fn main() {
    mtemp_pipeline::cli::run();
}
