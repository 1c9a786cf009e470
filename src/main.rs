fn main() -> anyhow::Result<()> {
    lbg_scan::cli_main::main()
}
