pub fn log_process_maps() {
    match proc_maps::get_process_maps(std::process::id() as proc_maps::Pid) {
        Ok(maps) => {
            for map in maps {
                log::debug!(
                    "map: {:#08x}+{:x}, {}, {:?}",
                    map.start(),
                    map.size(),
                    map.flags,
                    map.filename()
                );
            }
        }
        Err(e) => log::debug!("process maps unavailable: {}", e),
    }
}
