fn main() {
    pulseboard_monitor_lib::run()
}
